use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{StatusCode, header},
};
use eyre::WrapErr;
use hyper::{Response, header::HeaderValue};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::core::{
    gateway::GatewayService,
    pipeline::{Pipeline, RequestContext, RewriteStage, abort_response},
};

/// HTTP entry point of the gateway.
///
/// Each request gets its own execution scope and runs on its own task. The
/// scope is cancelled when the request future is dropped before completion,
/// which is what happens when the client connection goes away; the task then
/// skips the remaining stages and still records the request.
pub struct HttpHandler {
    pipeline: Arc<Pipeline>,
}

impl HttpHandler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn handle_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let scope = CancellationToken::new();
        let guard = scope.clone().drop_guard();

        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(
            async move { pipeline.handle(req, client_addr, scope).await }.in_current_span(),
        );
        let response = match task.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Request task failed: {}", e);
                abort_response(StatusCode::INTERNAL_SERVER_ERROR, "request task failed")
            }
        };

        guard.disarm();
        response
    }

    /// Router sending every request through the pipeline.
    ///
    /// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(
                move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                    let handler = self.clone();
                    async move { handler.handle_request(req, Some(client_addr)).await }
                },
            )
            .layer(TraceLayer::new_for_http())
    }
}

impl Clone for HttpHandler {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Rewrite stage used on the plain HTTP listener: requests for a vhost with
/// `enable_https` are answered with a permanent redirect to `https://`.
pub struct HttpsRedirect {
    https_port: u16,
}

impl HttpsRedirect {
    pub fn new(https_port: u16) -> Self {
        Self { https_port }
    }

    fn location(&self, host: &str, path_and_query: &str) -> String {
        let host = GatewayService::normalize_host(host);
        if self.https_port == 443 {
            format!("https://{host}{path_and_query}")
        } else {
            format!("https://{host}:{}{path_and_query}", self.https_port)
        }
    }
}

#[async_trait]
impl RewriteStage for HttpsRedirect {
    fn name(&self) -> &str {
        "https_redirect"
    }

    async fn rewrite(&self, ctx: &mut RequestContext) -> eyre::Result<()> {
        if !ctx.vhost().config().enable_https {
            return Ok(());
        }

        let path_and_query = ctx
            .request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let location = self.location(ctx.host(), path_and_query);
        let value = HeaderValue::from_str(&location)
            .wrap_err_with(|| format!("Invalid redirect location {location}"))?;

        let mut response = Response::new(AxumBody::empty());
        *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
        response.headers_mut().insert(header::LOCATION, value);
        ctx.response = Some(response);
        Ok(())
    }
}
