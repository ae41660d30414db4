pub mod access_log;
pub mod http_client;
pub mod http_handler;
pub mod tls;

/// Re-export commonly used types from adapters
pub use access_log::{AccessLogWriter, FileAccessLog};
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, HttpsRedirect};
pub use tls::{CertificateError, CertificateStore};
