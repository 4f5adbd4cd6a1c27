//! Request admission pipeline: context, metrics, access logging and the
//! orchestrator that ties them around a downstream handler.

mod access_log;
mod context;
mod layer;
mod metrics;
mod orchestrator;

pub use access_log::{
    AccessLogRecord, AccessLogSink, AccessLogger, ChannelSink, MemorySink, Outcome, SinkError,
    TracingSink, ACCESS_LOG_TARGET,
};
pub use context::{resolve_client_identity, Principal, RequestContext, RequestId, X_FORWARDED_FOR};
pub use layer::{AdmissionLayer, AdmissionService};
pub use metrics::{
    LatencyBucket, LatencyDistribution, MetricStatus, MetricsRecorder, MetricsSnapshot,
    RequestCount, RouteCount, INSTRUMENTATION_TARGET,
};
pub use orchestrator::{
    retry_after_secs, Pipeline, PipelineOptions, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_REQUEST_ID,
};
