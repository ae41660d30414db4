use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Transport failure of one upstream round trip.
///
/// All variants end the request with a 500 abort; none is retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connect refused or reset, or the exchange broke before response headers
    #[error("upstream connection failed: {0}")]
    ConnectionError(String),

    /// Connect (TCP + TLS handshake) did not finish in time
    #[error("upstream connect timed out after {0}s")]
    Timeout(u64),

    /// Outbound request could not be sent as built
    #[error("invalid outbound request: {0}")]
    InvalidRequest(String),
}

impl HttpClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpClientError::Timeout(_))
    }
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Port for the backend side of the proxy, one implementation per vhost.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Perform a single round trip to an upstream.
    ///
    /// Dropping the returned future aborts the exchange and releases the
    /// underlying connection.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
