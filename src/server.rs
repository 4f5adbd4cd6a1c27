//! HTTP server wiring the admission pipeline in front of the routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info};

use crate::config::{GatewayConfig, StoreBackend};
use crate::error::{GatewayError, Result};
use crate::pipeline::{
    AccessLogSink, AccessLogger, AdmissionLayer, MetricsRecorder, Pipeline, PipelineOptions,
};
use crate::ratelimit::{
    CounterStore, LimitPolicy, MemoryCounterStore, RateLimiter, RedisCounterStore, StaticTiers,
};

/// HTTP server for the gateway.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission pipeline shared by all connections
    pipeline: Arc<Pipeline>,
    /// Expiry sweeper of the memory counter store, if one is running
    sweeper: Option<JoinHandle<()>>,
}

impl GatewayServer {
    /// Create a server around an assembled pipeline.
    pub fn new(addr: SocketAddr, pipeline: Arc<Pipeline>) -> Self {
        Self {
            addr,
            pipeline,
            sweeper: None,
        }
    }

    /// Assemble the counter store, limiter and pipeline from configuration.
    pub async fn from_config(config: &GatewayConfig, sink: Arc<dyn AccessLogSink>) -> Result<Self> {
        config.validate()?;

        let mut sweeper = None;
        let store: Arc<dyn CounterStore> = match config.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryCounterStore::new());
                sweeper = Some(
                    store.spawn_sweeper(Duration::from_secs(config.store.sweep_interval_secs)),
                );
                info!("Using in-memory counter store");
                store as Arc<dyn CounterStore>
            }
            StoreBackend::Redis => {
                let store = RedisCounterStore::connect(&config.store.redis_url).await?;
                Arc::new(store) as Arc<dyn CounterStore>
            }
        };

        let mut limiter = RateLimiter::new(store, LimitPolicy::from_config(&config.rate_limiting)?);
        let tiers = StaticTiers::new(config.rate_limiting.tiers.clone());
        if !tiers.is_empty() {
            limiter = limiter.with_tiers(Arc::new(tiers));
        }

        let pipeline = Pipeline::new(
            limiter,
            Arc::new(MetricsRecorder::new(&config.metrics)?),
            AccessLogger::new(sink),
            PipelineOptions::from_config(config)?,
        );

        info!(
            threshold = config.rate_limiting.rate_limit_threshold,
            window_secs = config.rate_limiting.rate_limit_window_seconds,
            fail_open = config.rate_limiting.fail_open_on_store_unavailable,
            routes = config.rate_limiting.routes.len(),
            "Admission pipeline initialized"
        );

        Ok(Self {
            addr: config.server.listen_addr,
            pipeline: Arc::new(pipeline),
            sweeper,
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Wrap `routes` with the admission pipeline.
    ///
    /// The outer panic layer turns handler panics into `500` responses
    /// after the pipeline has recorded them.
    pub fn router(&self, routes: Router) -> Router {
        routes
            .layer(AdmissionLayer::new(Arc::clone(&self.pipeline)))
            .layer(CatchPanicLayer::new())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, routes: Router, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router(routes);
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatewayError::Server(e.to_string())
        })
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Routes served by the gateway itself.
pub fn health_routes() -> Router {
    Router::new().route("/", get(health))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "api-gateway" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{MemorySink, MetricStatus, Outcome};
    use axum::body::{to_bytes, Body};
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn server(yaml: &str, sink: Arc<MemorySink>) -> GatewayServer {
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        GatewayServer::from_config(&config, sink).await.unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let sink = Arc::new(MemorySink::new());
        let server = server("{}", sink.clone()).await;
        let app = server.router(health_routes());

        let response = app.oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "api-gateway");
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_unserved_server_stops_sweeper() {
        let server = server("{}", Arc::new(MemorySink::new())).await;
        let sweeper = server.sweeper.as_ref().unwrap().abort_handle();
        assert!(!sweeper.is_finished());

        drop(server);
        for _ in 0..10 {
            if sweeper.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn test_router_rate_limits() {
        let sink = Arc::new(MemorySink::new());
        let server = server(
            "rate_limiting:\n  rate_limit_threshold: 3\n  rate_limit_window_seconds: 60\n",
            sink.clone(),
        )
        .await;
        let app = server.router(health_routes());

        let mut statuses = Vec::new();
        for _ in 0..5 {
            let response = app.clone().oneshot(get_request("/")).await.unwrap();
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                let retry_after: u64 = response.headers()["retry-after"]
                    .to_str()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert!(retry_after > 0 && retry_after <= 60);
            }
            statuses.push(response.status());
        }

        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS,
            ]
        );
        assert_eq!(sink.len(), 5);
    }

    #[tokio::test]
    async fn test_panicking_route_becomes_500_and_is_recorded() {
        let sink = Arc::new(MemorySink::new());
        let server = server("{}", sink.clone()).await;
        let routes = Router::new().route(
            "/explode",
            get(|| async {
                if true {
                    panic!("route exploded");
                }
                "unreachable"
            }),
        );
        let app = server.router(routes);

        let response = app.oneshot(get_request("/explode")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].outcome,
            Outcome::HandlerError {
                details: "route exploded".to_string()
            }
        );
        assert_eq!(
            server
                .pipeline()
                .metrics()
                .request_count("GET", "/explode", MetricStatus::INTERNAL_ERROR),
            1
        );
    }
}
