use std::{
    error::Error as StdError,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use rustls_native_certs::load_native_certs;
use tracing::Instrument;

use crate::{
    config::VHostConfig,
    core::vhost::connect_timeout,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// Upper bound for the TLS handshake with an `https` upstream.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// TCP keep-alive interval on backend connections.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Idle pooled connections are closed after this long.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Maximum idle pooled connections kept per upstream.
pub const POOL_MAX_IDLE_PER_HOST: usize = 32;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Error produced when connecting (TCP + TLS) takes too long.
#[derive(Debug)]
pub struct ConnectTimeout(pub Duration);

impl fmt::Display for ConnectTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect timed out after {:?}", self.0)
    }
}

impl StdError for ConnectTimeout {}

/// Connector wrapper bounding the whole connect phase, TLS handshake included.
#[derive(Clone)]
pub struct TimeoutConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutConnector<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> tower::Service<Uri> for TimeoutConnector<C>
where
    C: tower::Service<Uri> + Send,
    C::Response: Send + 'static,
    C::Future: Send + 'static,
    C::Error: Into<BoxError>,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<C::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(uri);
        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(ConnectTimeout(timeout)) as BoxError),
            }
        })
    }
}

type PooledClient = Client<TimeoutConnector<HttpsConnector<HttpConnector>>, AxumBody>;

/// Backend client for one virtual host, using Hyper with Rustls.
///
/// Responsibilities:
/// * Connect timeout taken from the vhost `max_timeout`, bounded TLS handshake
/// * TCP keep-alive and an idle-limited, reusable connection pool
/// * Converts between Hyper body and Axum body types
///
/// A single attempt is made per request; dropping the future returned by
/// `send_request` aborts the exchange.
pub struct HttpClientAdapter {
    client: PooledClient,
    connect_timeout: Duration,
}

impl HttpClientAdapter {
    /// Create a client carrying the connection parameters of `vhost`.
    pub fn for_vhost(vhost: &VHostConfig) -> Result<Self> {
        Self::new(connect_timeout(vhost))
    }

    pub fn new(connect_timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(connect_timeout));
        http_connector.set_keepalive(Some(KEEPALIVE_INTERVAL));
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }
        tracing::debug!("Loaded {} native root certificates", root_cert_store.len());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let connector =
            TimeoutConnector::new(https_connector, connect_timeout + TLS_HANDSHAKE_TIMEOUT);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_timer(TokioTimer::new())
            .build::<_, AxumBody>(connector);

        Ok(Self {
            client,
            connect_timeout,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn map_error(&self, error: hyper_util::client::legacy::Error) -> HttpClientError {
        let mut source: Option<&(dyn StdError + 'static)> = error.source();
        while let Some(err) = source {
            if let Some(timeout) = err.downcast_ref::<ConnectTimeout>() {
                return HttpClientError::Timeout(timeout.0.as_secs());
            }
            if err
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut)
            {
                return HttpClientError::Timeout(self.connect_timeout.as_secs());
            }
            source = err.source();
        }
        HttpClientError::ConnectionError(format!("{error}: {}", error_chain(&error)))
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut parts = Vec::new();
    let mut source = error.source();
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    parts.join(": ")
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let span = tracing::debug_span!(
            "backend_request",
            backend.uri = %req.uri(),
            http.method = %req.method(),
            http.status_code = tracing::field::Empty,
        );

        match self.client.request(req).instrument(span.clone()).await {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                let (parts, hyper_body) = response.into_parts();
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                let error = self.map_error(e);
                if error.is_timeout() {
                    tracing::warn!("Backend connect timed out: {}", error);
                } else {
                    tracing::warn!("Backend request failed: {}", error);
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        let client = HttpClientAdapter::new(Duration::from_secs(3)).unwrap();
        assert_eq!(client.connect_timeout(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_uri_without_host_is_invalid() {
        let client = HttpClientAdapter::new(Duration::from_secs(1)).unwrap();
        let req = Request::builder()
            .uri("/relative")
            .body(AxumBody::empty())
            .unwrap();

        let err = client.send_request(req).await.unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClientAdapter::new(Duration::from_secs(1)).unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();

        let err = client.send_request(req).await.unwrap_err();
        assert!(matches!(err, HttpClientError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let client = HttpClientAdapter::new(Duration::from_secs(1)).unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/ping"))
            .body(AxumBody::empty())
            .unwrap();

        let response = client.send_request(req).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_timeout_connector_bounds_connect() {
        use tower::Service;

        #[derive(Clone)]
        struct NeverConnects;

        impl tower::Service<Uri> for NeverConnects {
            type Response = ();
            type Error = std::io::Error;
            type Future = Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _uri: Uri) -> Self::Future {
                Box::pin(std::future::pending())
            }
        }

        let mut connector = TimeoutConnector::new(NeverConnects, Duration::from_millis(20));
        let err = connector
            .call(Uri::from_static("http://10.255.255.1/"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ConnectTimeout>().is_some());
    }
}
