//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::RateLimitingConfig;
use crate::error::{GatewayError, Result};

use super::key::{ClientIdentity, RateLimitKey, RateLimitScope};
use super::rules::{LimitRule, RouteRules, MAX_WINDOW_SECONDS};
use super::store::{CounterSnapshot, CounterStore, StoreError};
use super::tier::{StandardTier, Tier, TierLookup};

/// Smallest retry hint handed out on rejection.
const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allow,
    /// The request must be rejected; the client may retry after the delay.
    Reject { retry_after: Duration },
}

/// Everything the limiter learned while deciding on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub decision: Decision,
    /// Threshold applied to this request
    pub limit: u64,
    /// Post-increment count, when the store answered
    pub count: Option<u64>,
    /// The store could not be consulted and the fallback policy decided
    pub store_unavailable: bool,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    /// Remaining requests in the current window.
    pub fn remaining(&self) -> u64 {
        self.count
            .map(|count| self.limit.saturating_sub(count))
            .unwrap_or(self.limit)
    }
}

/// Thresholds, windows and failure policy for the limiter.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    /// Applied when no route rule matches
    pub default_rule: LimitRule,
    /// Per-route overrides
    pub routes: RouteRules,
    /// Namespace for counter keys
    pub key_prefix: String,
    /// Deadline for a single store call
    pub store_timeout: Duration,
    /// Admit requests while the store is unavailable
    pub fail_open: bool,
}

impl LimitPolicy {
    /// Build a policy from configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        if config.rate_limit_threshold == 0 {
            return Err(GatewayError::Config(
                "rate_limit_threshold must be greater than zero".to_string(),
            ));
        }
        if config.rate_limit_window_seconds == 0 {
            return Err(GatewayError::Config(
                "rate_limit_window_seconds must be greater than zero".to_string(),
            ));
        }
        if config.rate_limit_window_seconds > MAX_WINDOW_SECONDS {
            return Err(GatewayError::Config(format!(
                "rate_limit_window_seconds must be at most {}",
                MAX_WINDOW_SECONDS
            )));
        }
        if let Some((identity, _)) = config.tiers.iter().find(|(_, threshold)| **threshold == 0) {
            return Err(GatewayError::Config(format!(
                "tier threshold for {} must be greater than zero",
                identity
            )));
        }
        if config.store_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            default_rule: LimitRule {
                threshold: config.rate_limit_threshold,
                window: Duration::from_secs(config.rate_limit_window_seconds),
            },
            routes: RouteRules::new(config.routes.clone())?,
            key_prefix: config.key_prefix.clone(),
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            fail_open: config.fail_open_on_store_unavailable,
        })
    }

    /// Resolve the scope and limit for a request.
    pub fn resolve(&self, method: &str, path: &str) -> (RateLimitScope, LimitRule) {
        match self.routes.find(method, path) {
            Some(rule) => (RateLimitScope::Route(rule.path.clone()), rule.limit()),
            None => (RateLimitScope::Global, self.default_rule),
        }
    }
}

/// The rate limiter that decides admission per client.
///
/// Holds no counter state itself; every decision goes through the shared
/// [`CounterStore`], so the limiter is cheap to share across tasks.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    tiers: Arc<dyn TierLookup>,
    policy: LimitPolicy,
}

impl RateLimiter {
    /// Create a new rate limiter over a counter store.
    pub fn new(store: Arc<dyn CounterStore>, policy: LimitPolicy) -> Self {
        Self {
            store,
            tiers: Arc::new(StandardTier),
            policy,
        }
    }

    /// Use a tier lookup for per-client threshold overrides.
    pub fn with_tiers(mut self, tiers: Arc<dyn TierLookup>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Decide whether a request may proceed.
    ///
    /// Increments exactly one counter per call, whatever the outcome.
    pub async fn admit(&self, identity: &ClientIdentity, method: &str, path: &str) -> Admission {
        let (scope, rule) = self.policy.resolve(method, path);
        let key = RateLimitKey::new(&self.policy.key_prefix, scope, identity).to_string_key();
        let limit = self.tier_for(identity).await.threshold(rule.threshold);

        trace!(key = %key, limit, window = ?rule.window, "Checking rate limit");

        match self.increment(&key, rule.window).await {
            Ok(snapshot) if snapshot.count <= limit => Admission {
                decision: Decision::Allow,
                limit,
                count: Some(snapshot.count),
                store_unavailable: false,
            },
            Ok(snapshot) => {
                let retry_after = snapshot.expires_in.max(MIN_RETRY_AFTER);
                debug!(
                    key = %key,
                    count = snapshot.count,
                    limit,
                    retry_after = ?retry_after,
                    "Rate limit exceeded"
                );
                Admission {
                    decision: Decision::Reject { retry_after },
                    limit,
                    count: Some(snapshot.count),
                    store_unavailable: false,
                }
            }
            Err(err) => {
                let decision = if self.policy.fail_open {
                    Decision::Allow
                } else {
                    Decision::Reject {
                        retry_after: rule.window,
                    }
                };
                warn!(
                    key = %key,
                    error = %err,
                    fail_open = self.policy.fail_open,
                    "Counter store unavailable, applying fallback policy"
                );
                Admission {
                    decision,
                    limit,
                    count: None,
                    store_unavailable: true,
                }
            }
        }
    }

    /// Clear the counter a request from `identity` would use.
    pub async fn reset(
        &self,
        identity: &ClientIdentity,
        method: &str,
        path: &str,
    ) -> std::result::Result<(), StoreError> {
        let key = self.key_for(identity, method, path);
        self.with_deadline(self.store.reset(&key)).await
    }

    /// Read the counter a request from `identity` would use.
    pub async fn current(
        &self,
        identity: &ClientIdentity,
        method: &str,
        path: &str,
    ) -> std::result::Result<Option<CounterSnapshot>, StoreError> {
        let key = self.key_for(identity, method, path);
        self.with_deadline(self.store.get(&key)).await
    }

    /// Look up the client's tier under the store deadline.
    async fn tier_for(&self, identity: &ClientIdentity) -> Tier {
        let timeout = self.policy.store_timeout;
        match tokio::time::timeout(timeout, self.tiers.tier_for(identity)).await {
            Ok(tier) => tier,
            Err(_) => {
                warn!(
                    client = %identity,
                    timeout = ?timeout,
                    "Tier lookup timed out, using standard tier"
                );
                Tier::Standard
            }
        }
    }

    fn key_for(&self, identity: &ClientIdentity, method: &str, path: &str) -> String {
        let (scope, _) = self.policy.resolve(method, path);
        RateLimitKey::new(&self.policy.key_prefix, scope, identity).to_string_key()
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> std::result::Result<CounterSnapshot, StoreError> {
        self.with_deadline(self.store.increment(key, window)).await
    }

    async fn with_deadline<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.policy.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.policy.store_timeout)),
        }
    }
}
