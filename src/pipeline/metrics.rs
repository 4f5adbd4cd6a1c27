//! Request count and latency aggregation.
//!
//! Each recorder owns its own Prometheus registry that every in-flight
//! request writes to concurrently. Nothing in the pipeline reads it back;
//! an exporter takes a [`MetricsSnapshot`] when it is scraped.

use std::time::Duration;

use dashmap::DashSet;
use prometheus::proto::Metric;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use serde::Serialize;
use tracing::warn;

use crate::config::MetricsConfig;
use crate::error::Result;

/// Target for diagnostics about instrumentation itself.
pub const INSTRUMENTATION_TARGET: &str = "gatehouse::instrumentation";

const REQUESTS_TOTAL: &str = "gatehouse_requests_total";
const REQUEST_LATENCY: &str = "gatehouse_request_latency_seconds";
const STORE_UNAVAILABLE_TOTAL: &str = "gatehouse_store_unavailable_total";
const DROPPED_SAMPLES_TOTAL: &str = "gatehouse_metric_samples_dropped_total";

/// The status label attached to a request sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricStatus {
    /// An HTTP status code
    Code(u16),
    /// The request was abandoned before a terminal event
    Cancelled,
}

impl MetricStatus {
    /// Status recorded when the handler fails.
    pub const INTERNAL_ERROR: MetricStatus = MetricStatus::Code(500);
}

impl std::fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricStatus::Code(code) => write!(f, "{}", code),
            MetricStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Accumulates request counts and latency distributions.
///
/// Series are labelled by `(method, path)`, and request counts also by
/// status. At most `max_series` distinct `(method, path)` pairs are
/// tracked; observations for new pairs beyond that are dropped.
pub struct MetricsRecorder {
    registry: Registry,
    requests: IntCounterVec,
    latencies: HistogramVec,
    store_unavailable: IntCounterVec,
    dropped_samples: IntCounter,
    routes: DashSet<(String, String)>,
    max_series: usize,
}

impl MetricsRecorder {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(REQUESTS_TOTAL, "Requests completed by the admission pipeline"),
            &["method", "path", "status"],
        )?;
        let latencies = HistogramVec::new(
            HistogramOpts::new(REQUEST_LATENCY, "Request latency in seconds")
                .buckets(config.latency_buckets.clone()),
            &["method", "path"],
        )?;
        let store_unavailable = IntCounterVec::new(
            Opts::new(
                STORE_UNAVAILABLE_TOTAL,
                "Requests decided without the counter store",
            ),
            &["method", "path"],
        )?;
        let dropped_samples = IntCounter::new(
            DROPPED_SAMPLES_TOTAL,
            "Observations dropped by the series limit",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latencies.clone()))?;
        registry.register(Box::new(store_unavailable.clone()))?;
        registry.register(Box::new(dropped_samples.clone()))?;

        Ok(Self {
            registry,
            requests,
            latencies,
            store_unavailable,
            dropped_samples,
            routes: DashSet::new(),
            max_series: config.max_series,
        })
    }

    /// The registry holding this recorder's metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one completed request.
    ///
    /// Increments the `(method, path, status)` counter and records the
    /// latency into the `(method, path)` histogram. Never fails: an
    /// observation for a new route beyond `max_series` is dropped and
    /// counted once.
    pub fn observe(&self, method: &str, path: &str, status: MetricStatus, latency: Duration) {
        if !self.track(method, path) {
            return;
        }
        let status = status.to_string();
        self.requests
            .with_label_values(&[method, path, &status])
            .inc();
        self.latencies
            .with_label_values(&[method, path])
            .observe(latency.as_secs_f64());
    }

    /// Record that a request was decided without the counter store.
    pub fn observe_store_unavailable(&self, method: &str, path: &str) {
        if self.track(method, path) {
            self.store_unavailable
                .with_label_values(&[method, path])
                .inc();
        }
    }

    /// Admit a route into the tracked set, or count the dropped sample.
    fn track(&self, method: &str, path: &str) -> bool {
        let route = (method.to_string(), path.to_string());
        if self.routes.contains(&route) {
            return true;
        }
        if self.routes.len() >= self.max_series {
            self.dropped_samples.inc();
            warn!(
                target: INSTRUMENTATION_TARGET,
                method,
                path,
                max_series = self.max_series,
                "Metric series limit reached, dropping sample"
            );
            return false;
        }
        self.routes.insert(route);
        true
    }

    /// Count of requests recorded for one series.
    pub fn request_count(&self, method: &str, path: &str, status: MetricStatus) -> u64 {
        let status = status.to_string();
        self.snapshot()
            .requests
            .into_iter()
            .find(|c| c.method == method && c.path == path && c.status == status)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Count of store-unavailable decisions for one route.
    pub fn store_unavailable_count(&self, method: &str, path: &str) -> u64 {
        self.snapshot()
            .store_unavailable
            .into_iter()
            .find(|c| c.method == method && c.path == path)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Copy the current aggregates for export.
    ///
    /// Reads are not synchronized with writers; a snapshot taken during
    /// traffic may be slightly behind.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();

        for family in self.registry.gather() {
            match family.get_name() {
                REQUESTS_TOTAL => {
                    snapshot.requests = family
                        .get_metric()
                        .iter()
                        .map(|m| RequestCount {
                            method: label(m, "method"),
                            path: label(m, "path"),
                            status: label(m, "status"),
                            count: m.get_counter().get_value() as u64,
                        })
                        .collect();
                }
                REQUEST_LATENCY => {
                    snapshot.latencies = family.get_metric().iter().map(distribution).collect();
                }
                STORE_UNAVAILABLE_TOTAL => {
                    snapshot.store_unavailable = family
                        .get_metric()
                        .iter()
                        .map(|m| RouteCount {
                            method: label(m, "method"),
                            path: label(m, "path"),
                            count: m.get_counter().get_value() as u64,
                        })
                        .collect();
                }
                DROPPED_SAMPLES_TOTAL => {
                    snapshot.dropped_samples = family
                        .get_metric()
                        .iter()
                        .map(|m| m.get_counter().get_value() as u64)
                        .sum();
                }
                _ => {}
            }
        }

        snapshot.requests.sort_by(|a, b| {
            (&a.method, &a.path, &a.status).cmp(&(&b.method, &b.path, &b.status))
        });
        snapshot
            .latencies
            .sort_by(|a, b| (&a.method, &a.path).cmp(&(&b.method, &b.path)));
        snapshot
            .store_unavailable
            .sort_by(|a, b| (&a.method, &a.path).cmp(&(&b.method, &b.path)));
        snapshot
    }
}

fn label(metric: &Metric, name: &str) -> String {
    metric
        .get_label()
        .iter()
        .find(|pair| pair.get_name() == name)
        .map(|pair| pair.get_value().to_string())
        .unwrap_or_default()
}

fn distribution(metric: &Metric) -> LatencyDistribution {
    let histogram = metric.get_histogram();
    let mut buckets: Vec<LatencyBucket> = histogram
        .get_bucket()
        .iter()
        .map(|bucket| LatencyBucket {
            le: bucket.get_upper_bound(),
            count: bucket.get_cumulative_count(),
        })
        .collect();
    // The registry leaves the +Inf bucket implicit.
    if buckets.last().map_or(true, |bucket| bucket.le.is_finite()) {
        buckets.push(LatencyBucket {
            le: f64::INFINITY,
            count: histogram.get_sample_count(),
        });
    }

    LatencyDistribution {
        method: label(metric, "method"),
        path: label(metric, "path"),
        count: histogram.get_sample_count(),
        sum_seconds: histogram.get_sample_sum(),
        buckets,
    }
}

/// Point-in-time copy of the recorder's aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub requests: Vec<RequestCount>,
    pub latencies: Vec<LatencyDistribution>,
    pub store_unavailable: Vec<RouteCount>,
    pub dropped_samples: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestCount {
    pub method: String,
    pub path: String,
    pub status: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyDistribution {
    pub method: String,
    pub path: String,
    pub count: u64,
    pub sum_seconds: f64,
    /// Cumulative counts; the last bucket's bound is `+Inf`
    pub buckets: Vec<LatencyBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyBucket {
    pub le: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteCount {
    pub method: String,
    pub path: String,
    pub count: u64,
}
