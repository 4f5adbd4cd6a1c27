//! Configuration management for Gatehouse.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::ratelimit::{LimitPolicy, RouteRule};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "GATEHOUSE";

/// Main configuration for the Gatehouse gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Request metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Prefer `x-forwarded-for` over the socket address for client identity
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Deadline for the downstream handler, in milliseconds
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_for: false,
            handler_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests admitted per client per window
    #[serde(default = "default_threshold")]
    pub rate_limit_threshold: u64,

    /// Window length in seconds, at most one year
    #[serde(default = "default_window_seconds")]
    pub rate_limit_window_seconds: u64,

    /// Deadline for a counter store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Admit requests while the counter store is unavailable
    #[serde(default = "default_fail_open")]
    pub fail_open_on_store_unavailable: bool,

    /// Status code of the rejection response
    #[serde(default = "default_status_code")]
    pub rate_limit_status_code: u16,

    /// Namespace for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-route overrides
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Elevated thresholds keyed by client identity (each non-zero)
    #[serde(default)]
    pub tiers: HashMap<String, u64>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rate_limit_threshold: default_threshold(),
            rate_limit_window_seconds: default_window_seconds(),
            store_timeout_ms: default_store_timeout_ms(),
            fail_open_on_store_unavailable: default_fail_open(),
            rate_limit_status_code: default_status_code(),
            key_prefix: default_key_prefix(),
            routes: Vec::new(),
            tiers: HashMap::new(),
        }
    }
}

impl RateLimitingConfig {
    /// The rejection status as an HTTP status code.
    ///
    /// Only 4xx and 5xx codes are accepted.
    pub fn rejection_status(&self) -> Result<StatusCode> {
        StatusCode::from_u16(self.rate_limit_status_code)
            .ok()
            .filter(|status| status.is_client_error() || status.is_server_error())
            .ok_or_else(|| {
                GatewayError::Config(format!(
                    "rate_limit_status_code must be a 4xx or 5xx status, got {}",
                    self.rate_limit_status_code
                ))
            })
    }
}

fn default_threshold() -> u64 {
    100
}

fn default_window_seconds() -> u64 {
    60
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_fail_open() -> bool {
    true
}

fn default_status_code() -> u16 {
    429
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

/// Which counter store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// How often the memory store purges expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

/// Request metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Upper bound on distinct `(method, path)` series
    #[serde(default = "default_max_series")]
    pub max_series: usize,

    /// Latency histogram bucket bounds, in seconds
    #[serde(default = "default_latency_buckets")]
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_series: default_max_series(),
            latency_buckets: default_latency_buckets(),
        }
    }
}

fn default_max_series() -> usize {
    10_000
}

/// Prometheus client default buckets.
pub fn default_latency_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
    ]
}

impl GatewayConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// Environment variables use the `GATEHOUSE` prefix and `__` as the
    /// section separator, e.g. `GATEHOUSE__RATE_LIMITING__RATE_LIMIT_THRESHOLD`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        let config: GatewayConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        LimitPolicy::from_config(&self.rate_limiting)?;
        self.rate_limiting.rejection_status()?;

        if self.server.handler_timeout_ms == Some(0) {
            return Err(GatewayError::Config(
                "handler_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(GatewayError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        let buckets = &self.metrics.latency_buckets;
        if buckets.is_empty()
            || buckets.iter().any(|b| !b.is_finite() || *b <= 0.0)
            || buckets.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(GatewayError::Config(
                "latency_buckets must be positive and strictly increasing".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::PathMatch;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.rate_limiting.rate_limit_threshold, 100);
        assert_eq!(config.rate_limiting.rate_limit_window_seconds, 60);
        assert!(config.rate_limiting.fail_open_on_store_unavailable);
        assert_eq!(
            config.rate_limiting.rejection_status().unwrap(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  listen_addr: 127.0.0.1:9000
  trust_forwarded_for: true
  handler_timeout_ms: 2500
rate_limiting:
  rate_limit_threshold: 3
  rate_limit_window_seconds: 60
  store_timeout_ms: 20
  fail_open_on_store_unavailable: false
  rate_limit_status_code: 503
  routes:
    - path: /api/auth
      match: prefix
      rate_limit_threshold: 10
      rate_limit_window_seconds: 30
  tiers:
    10.0.0.5: 1000
store:
  backend: redis
  redis_url: redis://cache:6379
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert!(config.server.trust_forwarded_for);
        assert_eq!(
            config.server.handler_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.rate_limiting.rate_limit_threshold, 3);
        assert!(!config.rate_limiting.fail_open_on_store_unavailable);
        assert_eq!(
            config.rate_limiting.rejection_status().unwrap(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(config.rate_limiting.routes.len(), 1);
        assert_eq!(config.rate_limiting.routes[0].path_match, PathMatch::Prefix);
        assert_eq!(config.rate_limiting.tiers["10.0.0.5"], 1000);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379");
    }

    #[test]
    fn test_rejects_success_status_code() {
        let yaml = r#"
rate_limiting:
  rate_limit_status_code: 200
"#;
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let yaml = r#"
rate_limiting:
  rate_limit_threshold: 0
"#;
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_zero_tier_threshold() {
        let yaml = r#"
rate_limiting:
  tiers:
    "10.0.0.5": 0
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("10.0.0.5"));
    }

    #[test]
    fn test_rejects_window_beyond_a_year() {
        let yaml = r#"
rate_limiting:
  rate_limit_window_seconds: 18446744073709551615
"#;
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_unordered_buckets() {
        let mut config = GatewayConfig::default();
        config.metrics.latency_buckets = vec![0.1, 0.05];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = GatewayConfig::load(None).unwrap();
        assert_eq!(config.server.listen_addr, default_listen_addr());
    }
}
