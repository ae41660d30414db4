pub mod access_log;
pub mod http_client;
