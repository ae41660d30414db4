//! Per-request pipeline.
//!
//! Every inbound request runs through the same ordered stages:
//!
//! ```text
//! Rewrite* -> Dispatch -> ResponseFilter* -> Respond -> (access log, detached)
//!     \___________\______________\____> Abort(status, msg)
//! ```
//!
//! Rewrite and response filter stages are optional trait objects held in
//! ordered lists. Any stage failure ends the request with a JSON abort
//! response; later stages are skipped. Once the execution scope is
//! cancelled no stage after dispatch runs.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use chrono::Utc;
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri, Version,
    header::{CONTENT_TYPE, HOST, HeaderValue},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::{HashKey, UpstreamConfig},
    core::{
        gateway::GatewayService,
        headers::{
            X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO, X_REQUEST_ID,
            normalize_response_headers, strip_hop_by_hop,
        },
        relay::{RelayBody, RelayCompletion},
        vhost::VirtualHost,
    },
    metrics::{self, BackendRequestTimer},
    ports::{
        access_log::{AccessLog, AccessRecord, RequestOutcome},
        http_client::HttpClientError,
    },
};

/// Non-standard status used for requests whose client went away.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Errors ending a request early.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("rewrite stage '{stage}' failed: {message}")]
    Rewrite { stage: String, message: String },

    #[error("response filter '{stage}' failed: {message}")]
    ResponseFilter { stage: String, message: String },

    #[error("backend request failed: {0}")]
    Dispatch(#[from] HttpClientError),

    #[error("invalid target uri: {0}")]
    InvalidTarget(String),

    #[error("no upstream available for vhost {0}")]
    NoUpstream(String),

    #[error("no response produced")]
    MissingResponse,

    #[error("request cancelled")]
    Cancelled,

    #[error("no virtual host for '{0}'")]
    NoVirtualHost(String),
}

impl PipelineError {
    /// Status of the abort response for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::NoVirtualHost(_) => StatusCode::NOT_FOUND,
            PipelineError::Cancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Build the structured abort response `{"status":"<code>","msg":"<text>"}`.
pub fn abort_response(status: StatusCode, msg: &str) -> Response<AxumBody> {
    let body = serde_json::json!({
        "status": status.as_u16().to_string(),
        "msg": msg,
    });
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// State carried through the stages of one request. Never shared.
pub struct RequestContext {
    /// Inbound request; its body is moved into the outbound request at dispatch
    pub request: Request<AxumBody>,
    /// Chosen upstream, selected at dispatch unless a rewrite stage set it
    pub upstream: Option<UpstreamConfig>,
    /// Outbound target, derived from the upstream unless a rewrite stage set it
    pub target: Option<Uri>,
    /// Response in progress; a rewrite stage setting it skips dispatch
    pub response: Option<Response<AxumBody>>,
    vhost: Arc<VirtualHost>,
    scope: CancellationToken,
    client_addr: Option<SocketAddr>,
    host: String,
    request_id: String,
    secure: bool,
    /// Label of where dispatch sent the request, for the access record
    dispatched_to: Option<String>,
}

impl RequestContext {
    pub fn new(
        request: Request<AxumBody>,
        vhost: Arc<VirtualHost>,
        scope: CancellationToken,
        client_addr: Option<SocketAddr>,
        secure: bool,
    ) -> Self {
        let host = request_host(&request);
        Self {
            request,
            upstream: None,
            target: None,
            response: None,
            vhost,
            scope,
            client_addr,
            host,
            request_id: Uuid::new_v4().to_string(),
            secure,
            dispatched_to: None,
        }
    }

    pub fn vhost(&self) -> &Arc<VirtualHost> {
        &self.vhost
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// Host as received, port included.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Scheme the client used to reach the gateway.
    pub fn inbound_scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    /// Key handed to the balancer, according to the vhost `hash_key`.
    pub fn balance_key(&self) -> String {
        match self.vhost.hash_key() {
            HashKey::ClientIp => self
                .client_addr
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| self.request.uri().path().to_string()),
            HashKey::Path => self.request.uri().path().to_string(),
            HashKey::Host => GatewayService::normalize_host(&self.host),
        }
    }

    /// Build the outbound request, taking the inbound body.
    ///
    /// `Host` is the target's authority, which for a balancer pick is the
    /// upstream's `host[:port]`.
    fn outbound_request(&mut self, target: Uri) -> Request<AxumBody> {
        let body = std::mem::take(self.request.body_mut());

        let mut headers: HeaderMap = self.request.headers().clone();
        strip_hop_by_hop(&mut headers);

        if let Some(value) = target
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        {
            headers.insert(HOST, value);
        }
        if let Some(addr) = self.client_addr {
            let ip = addr.ip().to_string();
            let mut hops: Vec<&str> = headers
                .get_all(&X_FORWARDED_FOR)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .collect();
            hops.push(&ip);
            if let Ok(value) = HeaderValue::from_str(&hops.join(", ")) {
                headers.insert(X_FORWARDED_FOR.clone(), value);
            }
        }
        headers.insert(
            X_FORWARDED_PROTO.clone(),
            HeaderValue::from_static(self.inbound_scheme()),
        );
        if let Ok(value) = HeaderValue::from_str(&self.host) {
            headers.insert(X_FORWARDED_HOST.clone(), value);
        }

        let mut outbound = Request::new(body);
        *outbound.method_mut() = self.request.method().clone();
        *outbound.uri_mut() = target;
        *outbound.version_mut() = Version::HTTP_11;
        *outbound.headers_mut() = headers;
        outbound
    }
}

/// Host of a request: the `Host` header (HTTP/1) or the URI authority (HTTP/2).
pub fn request_host<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}

/// Combine the upstream address with the inbound path and query.
pub fn target_uri(upstream: &UpstreamConfig, inbound: &Uri) -> Result<Uri, PipelineError> {
    let path_and_query = inbound.path_and_query().map_or("/", |pq| pq.as_str());
    let target = format!("{}://{}{}", upstream.scheme, upstream.authority(), path_and_query);
    target
        .parse()
        .map_err(|e| PipelineError::InvalidTarget(format!("{target}: {e}")))
}

/// `scheme://authority` of a target, or the whole URI when it is not absolute.
fn target_label(target: &Uri) -> String {
    match (target.scheme_str(), target.authority()) {
        (Some(scheme), Some(authority)) => format!("{scheme}://{authority}"),
        _ => target.to_string(),
    }
}

/// Stage running before dispatch.
///
/// May change the inbound request, pre-select `upstream` or `target`, or
/// answer the request directly by setting `response`.
#[async_trait]
pub trait RewriteStage: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn rewrite(&self, ctx: &mut RequestContext) -> eyre::Result<()>;
}

/// Stage running on the backend response before it is written downstream.
#[async_trait]
pub trait ResponseFilter: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn filter(
        &self,
        ctx: &mut RequestContext,
        response: &mut Response<AxumBody>,
    ) -> eyre::Result<()>;
}

enum Stage {
    Rewrite,
    Dispatch,
    ResponseFilter,
    Respond,
    Abort(PipelineError),
    Cancelled,
}

/// The request pipeline shared by all connections of one listener.
pub struct Pipeline {
    gateway: Arc<GatewayService>,
    access_log: Arc<dyn AccessLog>,
    rewrites: Vec<Arc<dyn RewriteStage>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
    secure: bool,
}

impl Pipeline {
    pub fn new(gateway: Arc<GatewayService>, access_log: Arc<dyn AccessLog>) -> Self {
        Self {
            gateway,
            access_log,
            rewrites: Vec::new(),
            response_filters: Vec::new(),
            secure: true,
        }
    }

    pub fn with_rewrite(mut self, stage: impl RewriteStage) -> Self {
        self.rewrites.push(Arc::new(stage));
        self
    }

    pub fn with_response_filter(mut self, filter: impl ResponseFilter) -> Self {
        self.response_filters.push(Arc::new(filter));
        self
    }

    /// Mark the pipeline as serving a plain HTTP listener.
    pub fn plaintext(mut self) -> Self {
        self.secure = false;
        self
    }

    /// Run one request to completion and return the response to write.
    ///
    /// The response body is relayed through a bounded buffer; the access
    /// record is submitted when that relay ends.
    pub async fn handle(
        &self,
        request: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
        scope: CancellationToken,
    ) -> Response<AxumBody> {
        let started_at = Instant::now();
        let raw_host = request_host(&request);
        let mut record = AccessRecord {
            timestamp: Utc::now(),
            request_id: String::new(),
            client_addr: client_addr.map(|addr| addr.to_string()),
            method: request.method().to_string(),
            host: raw_host.clone(),
            path: request.uri().path().to_string(),
            vhost: None,
            upstream: None,
            status: 0,
            bytes_sent: 0,
            duration_ms: 0,
            outcome: RequestOutcome::Completed,
        };

        let Some(vhost) = self.gateway.resolve(&raw_host) else {
            record.request_id = Uuid::new_v4().to_string();
            let error = PipelineError::NoVirtualHost(GatewayService::normalize_host(&raw_host));
            tracing::warn!(request.id = %record.request_id, "{}", error);
            let response = abort_response(error.status(), &error.to_string());
            return self.respond(response, RequestOutcome::Aborted, record, started_at);
        };

        let mut ctx = RequestContext::new(request, vhost, scope, client_addr, self.secure);
        record.request_id = ctx.request_id.clone();
        record.vhost = Some(ctx.vhost.label().to_string());

        let span = tracing::info_span!(
            "request",
            request.id = %ctx.request_id,
            http.method = %record.method,
            http.host = %raw_host,
            http.path = %record.path,
            vhost = %ctx.vhost.label(),
        );
        let (response, outcome) = self.run(&mut ctx).instrument(span).await;

        record.upstream = ctx.dispatched_to.take();
        self.respond(response, outcome, record, started_at)
    }

    async fn run(&self, ctx: &mut RequestContext) -> (Response<AxumBody>, RequestOutcome) {
        let mut stage = Stage::Rewrite;
        loop {
            stage = match stage {
                Stage::Rewrite => match self.rewrite(ctx).await {
                    Err(e) => Stage::Abort(e),
                    Ok(()) if ctx.scope.is_cancelled() => Stage::Cancelled,
                    Ok(()) if ctx.response.is_some() => Stage::Respond,
                    Ok(()) => Stage::Dispatch,
                },
                Stage::Dispatch => match self.dispatch(ctx).await {
                    Ok(response) => {
                        ctx.response = Some(response);
                        Stage::ResponseFilter
                    }
                    Err(PipelineError::Cancelled) => Stage::Cancelled,
                    Err(e) => Stage::Abort(e),
                },
                Stage::ResponseFilter if ctx.scope.is_cancelled() => Stage::Cancelled,
                Stage::ResponseFilter => match self.filter(ctx).await {
                    Ok(()) => Stage::Respond,
                    Err(e) => {
                        // Dropping the backend response releases its connection
                        ctx.response = None;
                        Stage::Abort(e)
                    }
                },
                Stage::Respond => match ctx.response.take() {
                    Some(response) => return (response, RequestOutcome::Completed),
                    None => Stage::Abort(PipelineError::MissingResponse),
                },
                Stage::Abort(error) => {
                    tracing::error!("Aborting request: {}", error);
                    return (
                        abort_response(error.status(), &error.to_string()),
                        RequestOutcome::Aborted,
                    );
                }
                Stage::Cancelled => {
                    tracing::info!("Request cancelled, skipping remaining stages");
                    ctx.response = None;
                    let mut response = Response::new(AxumBody::empty());
                    *response.status_mut() = PipelineError::Cancelled.status();
                    return (response, RequestOutcome::Cancelled);
                }
            };
        }
    }

    async fn rewrite(&self, ctx: &mut RequestContext) -> Result<(), PipelineError> {
        for stage in &self.rewrites {
            stage
                .rewrite(ctx)
                .await
                .map_err(|e| PipelineError::Rewrite {
                    stage: stage.name().to_string(),
                    message: e.to_string(),
                })?;
            if ctx.response.is_some() {
                tracing::debug!("Rewrite stage {} answered the request", stage.name());
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, ctx: &mut RequestContext) -> Result<Response<AxumBody>, PipelineError> {
        // A target set by a rewrite stage wins; the balancer is not consulted
        let (target, upstream_label) = match ctx.target.clone() {
            Some(target) => {
                let label = target_label(&target);
                (target, label)
            }
            None => {
                let upstream = match ctx.upstream.clone() {
                    Some(upstream) => upstream,
                    None => {
                        let key = ctx.balance_key();
                        let upstream = ctx
                            .vhost
                            .select_upstream(Some(key.as_str()))
                            .cloned()
                            .ok_or_else(|| {
                                PipelineError::NoUpstream(ctx.vhost.label().to_string())
                            })?;
                        metrics::increment_upstream_selection(
                            ctx.vhost.label(),
                            &upstream.to_string(),
                        );
                        ctx.upstream = Some(upstream.clone());
                        upstream
                    }
                };
                let target = target_uri(&upstream, ctx.request.uri())?;
                ctx.target = Some(target.clone());
                (target, upstream.to_string())
            }
        };

        let method = ctx.request.method().to_string();
        tracing::debug!("Dispatching to {} ({})", upstream_label, target);
        ctx.dispatched_to = Some(upstream_label.clone());

        let outbound = ctx.outbound_request(target);
        let client = ctx.vhost.client().clone();
        let scope = ctx.scope.clone();
        let _timer = BackendRequestTimer::new(&upstream_label, &method);

        let response = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                tracing::info!("Client went away, aborting request to {}", upstream_label);
                return Err(PipelineError::Cancelled);
            }
            result = client.send_request(outbound) => result?,
        };

        metrics::increment_backend_request_total(
            &upstream_label,
            &method,
            response.status().as_u16(),
        );
        Ok(response)
    }

    async fn filter(&self, ctx: &mut RequestContext) -> Result<(), PipelineError> {
        let Some(mut response) = ctx.response.take() else {
            return Err(PipelineError::MissingResponse);
        };
        for filter in &self.response_filters {
            filter
                .filter(ctx, &mut response)
                .await
                .map_err(|e| PipelineError::ResponseFilter {
                    stage: filter.name().to_string(),
                    message: e.to_string(),
                })?;
        }
        ctx.response = Some(response);
        Ok(())
    }

    /// Normalize headers and hand the body to the relay.
    fn respond(
        &self,
        mut response: Response<AxumBody>,
        outcome: RequestOutcome,
        mut record: AccessRecord,
        started_at: Instant,
    ) -> Response<AxumBody> {
        normalize_response_headers(response.headers_mut());
        if let Ok(value) = HeaderValue::from_str(&record.request_id) {
            response.headers_mut().insert(X_REQUEST_ID.clone(), value);
        }

        let status = response.status().as_u16();
        record.status = status;
        metrics::increment_request_total(
            record.vhost.as_deref().unwrap_or("-"),
            &record.method,
            status,
        );
        if outcome == RequestOutcome::Aborted {
            metrics::increment_abort(status);
        }

        if outcome == RequestOutcome::Cancelled {
            // Nobody reads this response, log it right away
            record.duration_ms = started_at.elapsed().as_millis() as u64;
            record.outcome = outcome;
            self.access_log.submit(record);
            return response;
        }

        RelayBody::wrap(
            response,
            RelayCompletion {
                sink: self.access_log.clone(),
                record,
                started_at,
                outcome,
            },
        )
    }
}
