//! The admission pipeline.
//!
//! Every request walks the same stages in order:
//!
//! 1. begin a [`RequestContext`]
//! 2. rate limit check (a rejection ends the request here)
//! 3. downstream handler
//! 4. metrics, then the access log record
//!
//! Stage 4 runs exactly once per request whichever way it ends: success,
//! handler failure, rejection, timeout, or the request future being
//! dropped.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::ratelimit::{Decision, RateLimiter};

use super::access_log::{AccessLogRecord, AccessLogger, Outcome};
use super::context::{RequestContext, RequestId};
use super::metrics::{MetricStatus, MetricsRecorder};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Request-independent pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Status code of rate limit rejections
    pub rejection_status: StatusCode,
    /// Prefer `x-forwarded-for` over the socket address
    pub trust_forwarded_for: bool,
    /// Deadline for the downstream handler
    pub handler_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            rejection_status: StatusCode::TOO_MANY_REQUESTS,
            trust_forwarded_for: false,
            handler_timeout: None,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            rejection_status: config.rate_limiting.rejection_status()?,
            trust_forwarded_for: config.server.trust_forwarded_for,
            handler_timeout: config.server.handler_timeout(),
        })
    }
}

/// Composes rate limiting, metrics and access logging around a handler.
pub struct Pipeline {
    limiter: RateLimiter,
    metrics: Arc<MetricsRecorder>,
    access_log: AccessLogger,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        limiter: RateLimiter,
        metrics: Arc<MetricsRecorder>,
        access_log: AccessLogger,
        options: PipelineOptions,
    ) -> Self {
        Self {
            limiter,
            metrics,
            access_log,
            options,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Run a request through the pipeline.
    ///
    /// `downstream` is invoked only if the request is admitted. Its error,
    /// or its panic, is observed and then handed back to the caller
    /// unchanged.
    pub async fn handle<B, R, E, F, Fut>(
        &self,
        mut request: Request<B>,
        downstream: F,
    ) -> std::result::Result<Response<R>, E>
    where
        F: FnOnce(Request<B>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<R>, E>>,
        R: Default,
        E: std::fmt::Display,
    {
        let context = RequestContext::begin(&request, self.options.trust_forwarded_for);
        let span = info_span!(
            "request",
            request_id = %context.request_id,
            method = %context.method,
            path = %context.path,
            client = %context.client_identity,
        );

        async move {
            let request_id = context.request_id;
            let mut completion = Completion::new(context, &self.metrics, &self.access_log);

            let admission = {
                let context = completion.context();
                self.limiter
                    .admit(&context.client_identity, context.method.as_str(), &context.path)
                    .await
            };
            completion.store_unavailable = admission.store_unavailable;

            if let Decision::Reject { retry_after } = admission.decision {
                debug!(retry_after = ?retry_after, "Request rejected by rate limiter");
                completion.finish(
                    MetricStatus::Code(self.options.rejection_status.as_u16()),
                    Outcome::RateLimited { retry_after },
                );
                return Ok(self.rejection_response(request_id, retry_after, admission.limit));
            }

            request.extensions_mut().insert(request_id);
            let invocation = AssertUnwindSafe(downstream(request)).catch_unwind();

            let result = match self.options.handler_timeout {
                Some(deadline) => match tokio::time::timeout(deadline, invocation).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(deadline = ?deadline, "Downstream handler timed out");
                        completion.finish(
                            MetricStatus::Code(StatusCode::GATEWAY_TIMEOUT.as_u16()),
                            Outcome::TimedOut { after: deadline },
                        );
                        return Ok(status_response(StatusCode::GATEWAY_TIMEOUT, request_id));
                    }
                },
                None => invocation.await,
            };

            match result {
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    completion.finish(MetricStatus::Code(status), Outcome::Success { status });
                    Ok(response)
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "Downstream handler failed");
                    completion.finish(
                        MetricStatus::INTERNAL_ERROR,
                        Outcome::HandlerError {
                            details: err.to_string(),
                        },
                    );
                    Err(err)
                }
                Err(panic) => {
                    let details = panic_message(panic.as_ref());
                    warn!(error = %details, "Downstream handler panicked");
                    completion.finish(
                        MetricStatus::INTERNAL_ERROR,
                        Outcome::HandlerError { details },
                    );
                    std::panic::resume_unwind(panic)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn rejection_response<R: Default>(
        &self,
        request_id: RequestId,
        retry_after: Duration,
        limit: u64,
    ) -> Response<R> {
        let mut response = status_response(self.options.rejection_status, request_id);
        let headers = response.headers_mut();
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
        response
    }
}

fn status_response<R: Default>(status: StatusCode, request_id: RequestId) -> Response<R> {
    let mut response = Response::new(R::default());
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// Whole seconds for the `Retry-After` header, rounded up, at least 1.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    let secs = if retry_after.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    };
    secs.max(1)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Emits metrics and the access log record for one request, exactly once.
///
/// `finish` consumes the guard; if it is dropped unfinished the request
/// was abandoned and is recorded as cancelled.
struct Completion<'a> {
    context: RequestContext,
    metrics: &'a MetricsRecorder,
    access_log: &'a AccessLogger,
    store_unavailable: bool,
    finished: bool,
}

impl<'a> Completion<'a> {
    fn new(
        context: RequestContext,
        metrics: &'a MetricsRecorder,
        access_log: &'a AccessLogger,
    ) -> Self {
        Self {
            context,
            metrics,
            access_log,
            store_unavailable: false,
            finished: false,
        }
    }

    fn context(&self) -> &RequestContext {
        &self.context
    }

    fn finish(mut self, status: MetricStatus, outcome: Outcome) {
        self.emit(status, outcome);
    }

    fn emit(&mut self, status: MetricStatus, outcome: Outcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        let latency = self.context.elapsed();
        let method = self.context.method.as_str();
        self.metrics.observe(method, &self.context.path, status, latency);
        if self.store_unavailable {
            self.metrics.observe_store_unavailable(method, &self.context.path);
        }

        self.access_log.record(AccessLogRecord::new(
            &self.context,
            outcome,
            latency,
            self.store_unavailable,
        ));
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(request_id = %self.context.request_id, "Request cancelled before completion");
            self.emit(MetricStatus::Cancelled, Outcome::Cancelled);
        }
    }
}
