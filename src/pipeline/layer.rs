//! Tower integration for the admission pipeline.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use tower::{Layer, Service};

use super::orchestrator::Pipeline;

/// Wraps a service with the admission pipeline.
#[derive(Clone)]
pub struct AdmissionLayer {
    pipeline: Arc<Pipeline>,
}

impl AdmissionLayer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

/// A service running every request through the admission pipeline.
///
/// Errors of the inner service pass through unchanged.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness and leave a clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let pipeline = Arc::clone(&self.pipeline);

        Box::pin(async move {
            pipeline
                .handle(request, move |request| inner.call(request))
                .await
        })
    }
}
