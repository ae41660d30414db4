use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a request ended, as seen by the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Backend (or abort) response fully relayed
    Completed,
    /// An abort response was produced instead of a backend response
    Aborted,
    /// The execution scope was cancelled before dispatch finished
    Cancelled,
    /// The client went away while the body was being relayed
    ClientClosed,
    /// Reading the response body failed after headers were sent
    BodyError,
}

/// One finished-request record.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub client_addr: Option<String>,
    pub method: String,
    pub host: String,
    pub path: String,
    pub vhost: Option<String>,
    pub upstream: Option<String>,
    pub status: u16,
    pub bytes_sent: u64,
    pub duration_ms: u64,
    pub outcome: RequestOutcome,
}

/// Sink for finished-request records.
///
/// `submit` must never block the response path; implementations drop
/// records they cannot accept and never report errors back.
pub trait AccessLog: Send + Sync + 'static {
    fn submit(&self, record: AccessRecord);
}

/// Sink discarding every record.
pub struct NullAccessLog;

impl AccessLog for NullAccessLog {
    fn submit(&self, _record: AccessRecord) {}
}
