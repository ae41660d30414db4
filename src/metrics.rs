//! Lightweight metrics helpers for Echoes.
//!
//! Convenience functions and RAII timers wrapping the `metrics` crate
//! macros. No exporter is installed here; the embedding application may
//! install any compatible recorder, otherwise the calls are no-ops.
//!
//! Provided metrics (labels vary by family):
//! * `echoes_requests_total` (counter)
//! * `echoes_request_duration_seconds` (histogram)
//! * `echoes_backend_requests_total` (counter)
//! * `echoes_backend_request_duration_seconds` (histogram)
//! * `echoes_upstream_selections_total` (counter)
//! * `echoes_aborts_total` (counter)
//! * `echoes_access_log_dropped_total` (counter)
use std::time::{Duration, Instant};

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::Lazy;

pub const ECHOES_REQUESTS_TOTAL: &str = "echoes_requests_total";
pub const ECHOES_REQUEST_DURATION_SECONDS: &str = "echoes_request_duration_seconds";
pub const ECHOES_BACKEND_REQUESTS_TOTAL: &str = "echoes_backend_requests_total";
pub const ECHOES_BACKEND_REQUEST_DURATION_SECONDS: &str = "echoes_backend_request_duration_seconds";
pub const ECHOES_UPSTREAM_SELECTIONS_TOTAL: &str = "echoes_upstream_selections_total";
pub const ECHOES_ABORTS_TOTAL: &str = "echoes_aborts_total";
pub const ECHOES_ACCESS_LOG_DROPPED_TOTAL: &str = "echoes_access_log_dropped_total";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        ECHOES_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests answered by the gateway."
    );
    describe_histogram!(
        ECHOES_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from request arrival until the response body ended."
    );
    describe_counter!(
        ECHOES_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests dispatched to upstreams."
    );
    describe_histogram!(
        ECHOES_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of upstream round trips until response headers."
    );
    describe_counter!(
        ECHOES_UPSTREAM_SELECTIONS_TOTAL,
        Unit::Count,
        "Upstream picks made by the load balancer."
    );
    describe_counter!(
        ECHOES_ABORTS_TOTAL,
        Unit::Count,
        "Synthesized abort responses, by status."
    );
    describe_counter!(
        ECHOES_ACCESS_LOG_DROPPED_TOTAL,
        Unit::Count,
        "Access records dropped because the log queue was full."
    );
});

/// Increment the total request counter for an answered request.
pub fn increment_request_total(vhost: &str, method: &str, status: u16) {
    counter!(
        ECHOES_REQUESTS_TOTAL,
        "vhost" => vhost.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the full duration of a request, body relay included.
pub fn record_request_duration(method: &str, duration: Duration) {
    histogram!(ECHOES_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Increment the count of requests dispatched to an upstream.
pub fn increment_backend_request_total(upstream: &str, method: &str, status: u16) {
    counter!(
        ECHOES_BACKEND_REQUESTS_TOTAL,
        "upstream" => upstream.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_backend_request_duration(upstream: &str, method: &str, duration: Duration) {
    histogram!(
        ECHOES_BACKEND_REQUEST_DURATION_SECONDS,
        "upstream" => upstream.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_upstream_selection(vhost: &str, upstream: &str) {
    counter!(
        ECHOES_UPSTREAM_SELECTIONS_TOTAL,
        "vhost" => vhost.to_string(),
        "upstream" => upstream.to_string()
    )
    .increment(1);
}

pub fn increment_abort(status: u16) {
    counter!(ECHOES_ABORTS_TOTAL, "status" => status.to_string()).increment(1);
}

pub fn increment_access_log_dropped() {
    counter!(ECHOES_ACCESS_LOG_DROPPED_TOTAL).increment(1);
}

/// RAII helper measuring an upstream round trip.
pub struct BackendRequestTimer {
    start: Instant,
    upstream: String,
    method: String,
}

impl BackendRequestTimer {
    pub fn new(upstream: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            upstream: upstream.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        record_backend_request_duration(&self.upstream, &self.method, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIPTIONS);
    tracing::debug!("Echoes metric descriptions registered");
}
