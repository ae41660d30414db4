//! Bounded response body relay.
//!
//! The backend body is pulled through a fixed-size read buffer, so memory
//! use per response does not depend on the body size. When the relay ends,
//! whichever way it ends, the pending access record is completed and handed
//! to the access log; this is the detached log stage of the pipeline.
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use futures_util::{
    Stream, StreamExt, TryStreamExt,
    stream::BoxStream,
};
use hyper::{Method, Response, StatusCode, header::CONTENT_LENGTH};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{
    metrics,
    ports::access_log::{AccessLog, AccessRecord, RequestOutcome},
};

/// Size of the intermediate buffer used to relay bodies.
pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Streaming,
    Finished,
    Failed,
}

/// Everything needed to emit the access record once the body is done.
pub struct RelayCompletion {
    pub sink: Arc<dyn AccessLog>,
    pub record: AccessRecord,
    pub started_at: Instant,
    /// Outcome reported when the body is relayed to the end
    pub outcome: RequestOutcome,
}

/// Stream adapter relaying a body chunk by chunk.
pub struct RelayBody {
    inner: BoxStream<'static, io::Result<Bytes>>,
    completion: Option<RelayCompletion>,
    expected_len: Option<u64>,
    bytes_sent: u64,
    state: RelayState,
}

impl RelayBody {
    pub fn new(body: AxumBody, expected_len: Option<u64>, completion: RelayCompletion) -> Self {
        let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
        let inner = ReaderStream::with_capacity(reader, RELAY_BUFFER_SIZE).boxed();
        Self {
            inner,
            completion: Some(completion),
            expected_len,
            bytes_sent: 0,
            state: RelayState::Streaming,
        }
    }

    /// Swap a response body for a relayed one.
    ///
    /// Answers to `HEAD` and `204`/`304` responses carry no body whatever
    /// their `content-length` says, so nothing is expected from them.
    pub fn wrap(response: Response<AxumBody>, completion: RelayCompletion) -> Response<AxumBody> {
        let (parts, body) = response.into_parts();
        let bodiless = completion.record.method == Method::HEAD.as_str()
            || parts.status == StatusCode::NO_CONTENT
            || parts.status == StatusCode::NOT_MODIFIED;
        let expected_len = if bodiless {
            Some(0)
        } else {
            parts
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
        };
        let relay = Self::new(body, expected_len, completion);
        Response::from_parts(parts, AxumBody::from_stream(relay))
    }

    fn finish(&mut self) {
        let Some(completion) = self.completion.take() else {
            return;
        };

        let outcome = match self.state {
            RelayState::Finished => completion.outcome,
            RelayState::Failed => RequestOutcome::BodyError,
            // The server may stop polling once a known length has been written
            RelayState::Streaming if self.expected_len == Some(self.bytes_sent) => {
                completion.outcome
            }
            RelayState::Streaming => RequestOutcome::ClientClosed,
        };

        let mut record = completion.record;
        record.bytes_sent = self.bytes_sent;
        record.duration_ms = completion.started_at.elapsed().as_millis() as u64;
        record.outcome = outcome;

        if outcome == RequestOutcome::ClientClosed {
            tracing::info!(
                request.id = %record.request_id,
                "Client went away after {} body bytes",
                self.bytes_sent
            );
        }

        metrics::record_request_duration(&record.method, completion.started_at.elapsed());
        completion.sink.submit(record);
    }
}

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.state != RelayState::Streaming {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes_sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Status and headers are already on the wire at this point,
                // the client only sees a truncated body.
                let request_id = this
                    .completion
                    .as_ref()
                    .map(|c| c.record.request_id.clone())
                    .unwrap_or_default();
                tracing::error!(
                    request.id = %request_id,
                    "Response body relay failed after {} bytes: {}",
                    this.bytes_sent,
                    e
                );
                this.state = RelayState::Failed;
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.state = RelayState::Finished;
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use http_body_util::BodyExt;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<AccessRecord>>);

    impl AccessLog for Collect {
        fn submit(&self, record: AccessRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn completion(sink: Arc<Collect>) -> RelayCompletion {
        RelayCompletion {
            sink,
            record: AccessRecord {
                timestamp: Utc::now(),
                request_id: "req-1".to_string(),
                client_addr: None,
                method: "GET".to_string(),
                host: "example.com".to_string(),
                path: "/".to_string(),
                vhost: None,
                upstream: None,
                status: 200,
                bytes_sent: 0,
                duration_ms: 0,
                outcome: RequestOutcome::Completed,
            },
            started_at: Instant::now(),
            outcome: RequestOutcome::Completed,
        }
    }

    #[tokio::test]
    async fn test_relay_chunks_are_bounded() {
        let payload = vec![7u8; RELAY_BUFFER_SIZE * 5 + 123];
        let sink = Arc::new(Collect::default());
        let mut relay = RelayBody::new(
            AxumBody::from(payload.clone()),
            None,
            completion(sink.clone()),
        );

        let mut received = Vec::new();
        while let Some(chunk) = relay.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= RELAY_BUFFER_SIZE);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes_sent, payload.len() as u64);
        assert_eq!(records[0].outcome, RequestOutcome::Completed);
    }

    #[tokio::test]
    async fn test_record_submitted_once_after_body_ends() {
        let sink = Arc::new(Collect::default());
        let response = Response::new(AxumBody::from("hello"));
        let response = RelayBody::wrap(response, completion(sink.clone()));

        assert!(sink.0.lock().unwrap().is_empty());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello");

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes_sent, 5);
    }

    #[tokio::test]
    async fn test_dropped_relay_reports_client_closed() {
        let sink = Arc::new(Collect::default());
        let stream = futures_util::stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"first")),
            Ok(Bytes::from_static(b"second")),
        ]);
        let mut relay = RelayBody::new(
            AxumBody::from_stream(stream),
            None,
            completion(sink.clone()),
        );

        let first = relay.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(relay);

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, RequestOutcome::ClientClosed);
    }

    #[tokio::test]
    async fn test_unpolled_bodiless_responses_complete() {
        for (method, status) in [
            ("HEAD", StatusCode::OK),
            ("GET", StatusCode::NO_CONTENT),
            ("GET", StatusCode::NOT_MODIFIED),
        ] {
            let sink = Arc::new(Collect::default());
            let mut completion = completion(sink.clone());
            completion.record.method = method.to_string();
            let mut response = Response::new(AxumBody::empty());
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, hyper::header::HeaderValue::from_static("1234"));

            // The server writes the head and drops the body without polling it
            drop(RelayBody::wrap(response, completion));

            let records = sink.0.lock().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].outcome, RequestOutcome::Completed, "{method} {status}");
            assert_eq!(records[0].bytes_sent, 0);
        }
    }

    #[tokio::test]
    async fn test_unpolled_get_with_length_is_client_closed() {
        let sink = Arc::new(Collect::default());
        let mut response = Response::new(AxumBody::from("hello"));
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, hyper::header::HeaderValue::from_static("5"));

        drop(RelayBody::wrap(response, completion(sink.clone())));

        assert_eq!(sink.0.lock().unwrap()[0].outcome, RequestOutcome::ClientClosed);
    }

    #[tokio::test]
    async fn test_body_error_is_recorded() {
        let sink = Arc::new(Collect::default());
        let stream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "backend reset")),
        ]);
        let mut relay = RelayBody::new(
            AxumBody::from_stream(stream),
            None,
            completion(sink.clone()),
        );

        let mut saw_error = false;
        while let Some(item) = relay.next().await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, RequestOutcome::BodyError);
    }
}
