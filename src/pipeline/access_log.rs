//! Structured access log records and sinks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::context::RequestContext;
use super::metrics::INSTRUMENTATION_TARGET;

/// Tracing target used by [`TracingSink`].
pub const ACCESS_LOG_TARGET: &str = "access_log";

/// How a request left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The handler produced a response.
    Success { status: u16 },
    /// The handler failed; the failure was propagated to the caller.
    HandlerError { details: String },
    /// The request was rejected before reaching the handler.
    RateLimited {
        #[serde(serialize_with = "serialize_duration_secs")]
        retry_after: Duration,
    },
    /// The handler missed its deadline and a timeout response was returned.
    TimedOut {
        #[serde(serialize_with = "serialize_duration_secs")]
        after: Duration,
    },
    /// The request was abandoned before reaching a terminal state.
    Cancelled,
}

fn serialize_duration_secs<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success { status } => write!(f, "{}", status),
            Outcome::HandlerError { details } => write!(f, "error: {}", details),
            Outcome::RateLimited { retry_after } => {
                write!(f, "rate_limited (retry after {:?})", retry_after)
            }
            Outcome::TimedOut { after } => write!(f, "timed_out after {:?}", after),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One completed request. Immutable once emitted.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogRecord {
    pub request_id: Uuid,
    pub client_identity: String,
    pub principal: Option<String>,
    pub method: String,
    pub path: String,
    pub outcome: Outcome,
    pub latency_seconds: f64,
    pub timestamp: DateTime<Utc>,
    /// The rate limit decision was made without the counter store
    pub store_unavailable: bool,
}

impl AccessLogRecord {
    pub fn new(
        context: &RequestContext,
        outcome: Outcome,
        latency: Duration,
        store_unavailable: bool,
    ) -> Self {
        Self {
            request_id: context.request_id.0,
            client_identity: context.client_identity.to_string(),
            principal: context.principal.clone(),
            method: context.method.to_string(),
            path: context.path.clone(),
            outcome,
            latency_seconds: latency.as_secs_f64(),
            timestamp: context.received_at,
            store_unavailable,
        }
    }
}

/// Errors raised while appending a record.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("access log sink is full")]
    Full,
    #[error("access log sink is closed")]
    Closed,
    #[error("access log sink failed: {0}")]
    Other(String),
}

/// Destination for access log records.
///
/// Delivery is best effort; an error is reported on the diagnostic
/// channel and never reaches the request.
pub trait AccessLogSink: Send + Sync {
    fn append(&self, record: &AccessLogRecord) -> Result<(), SinkError>;
}

/// Emits records as `tracing` events on the `access_log` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AccessLogSink for TracingSink {
    fn append(&self, record: &AccessLogRecord) -> Result<(), SinkError> {
        info!(
            target: ACCESS_LOG_TARGET,
            request_id = %record.request_id,
            client = %record.client_identity,
            principal = record.principal.as_deref(),
            method = %record.method,
            path = %record.path,
            outcome = %record.outcome,
            latency_seconds = record.latency_seconds,
            timestamp = %record.timestamp.to_rfc3339(),
            store_unavailable = record.store_unavailable,
            "request completed"
        );
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AccessLogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AccessLogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AccessLogSink for MemorySink {
    fn append(&self, record: &AccessLogRecord) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Hands records to a consumer task through a bounded channel.
///
/// Used to feed a persistence collaborator without blocking requests:
/// a full channel drops the record.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<AccessLogRecord>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AccessLogRecord>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl AccessLogSink for ChannelSink {
    fn append(&self, record: &AccessLogRecord) -> Result<(), SinkError> {
        self.sender.try_send(record.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Writes one record per request to a sink, swallowing sink failures.
#[derive(Clone)]
pub struct AccessLogger {
    sink: Arc<dyn AccessLogSink>,
}

impl AccessLogger {
    pub fn new(sink: Arc<dyn AccessLogSink>) -> Self {
        Self { sink }
    }

    /// Emit the record for a finished request.
    pub fn record(&self, record: AccessLogRecord) {
        if let Err(err) = self.sink.append(&record) {
            warn!(
                target: INSTRUMENTATION_TARGET,
                error = %err,
                request_id = %record.request_id,
                "Failed to append access log record"
            );
        }
    }
}

impl Default for AccessLogger {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    struct BrokenSink;

    impl AccessLogSink for BrokenSink {
        fn append(&self, _record: &AccessLogRecord) -> Result<(), SinkError> {
            Err(SinkError::Other("disk full".to_string()))
        }
    }

    fn record(outcome: Outcome) -> AccessLogRecord {
        let request = Request::builder()
            .uri("/api/items")
            .header("x-forwarded-for", "1.2.3.4")
            .body(())
            .unwrap();
        let context = RequestContext::begin(&request, false);
        AccessLogRecord::new(&context, outcome, Duration::from_millis(12), false)
    }

    #[test]
    fn test_record_fields() {
        let record = record(Outcome::Success { status: 201 });
        assert_eq!(record.client_identity, "1.2.3.4");
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/api/items");
        assert!((record.latency_seconds - 0.012).abs() < 1e-9);
    }

    #[test]
    fn test_record_serializes_tagged_outcome() {
        let json = serde_json::to_value(record(Outcome::RateLimited {
            retry_after: Duration::from_secs(60),
        }))
        .unwrap();

        assert_eq!(json["outcome"]["kind"], "rate_limited");
        assert_eq!(json["outcome"]["retry_after"], 60.0);
        assert_eq!(json["client_identity"], "1.2.3.4");
        assert_eq!(json["store_unavailable"], false);
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = Arc::new(MemorySink::new());
        let logger = AccessLogger::new(sink.clone());

        logger.record(record(Outcome::Cancelled));
        logger.record(record(Outcome::Success { status: 200 }));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.records()[0].outcome, Outcome::Cancelled);
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let logger = AccessLogger::new(Arc::new(BrokenSink));
        logger.record(record(Outcome::Success { status: 200 }));
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_and_reports_full() {
        let (sink, mut receiver) = ChannelSink::new(1);

        tokio_test::assert_ok!(sink.append(&record(Outcome::Success { status: 200 })));
        assert!(matches!(
            sink.append(&record(Outcome::Success { status: 200 })),
            Err(SinkError::Full)
        ));

        let delivered = receiver.recv().await.unwrap();
        assert_eq!(delivered.outcome, Outcome::Success { status: 200 });

        drop(receiver);
        assert!(matches!(
            sink.append(&record(Outcome::Cancelled)),
            Err(SinkError::Closed)
        ));
    }
}
