//! Rate limiting logic and counter storage.

mod counter;
mod key;
mod limiter;
mod redis_store;
mod rules;
mod store;
mod tier;

pub use counter::{CounterEntry, MemoryCounterStore};
pub use key::{ClientIdentity, RateLimitKey, RateLimitScope, UNKNOWN_CLIENT};
pub use limiter::{Admission, Decision, LimitPolicy, RateLimiter};
pub use redis_store::RedisCounterStore;
pub use rules::{LimitRule, PathMatch, RouteRule, RouteRules, MAX_WINDOW, MAX_WINDOW_SECONDS};
pub use store::{CounterSnapshot, CounterStore, StoreError};
pub use tier::{StandardTier, StaticTiers, Tier, TierLookup};

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{CounterSnapshot, CounterStore, StoreError};

    /// A store whose backend is down.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(
            &self,
            _key: &str,
            _window: Duration,
        ) -> Result<CounterSnapshot, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn reset(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// A store that never answers.
    pub(crate) struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn increment(
            &self,
            _key: &str,
            _window: Duration,
        ) -> Result<CounterSnapshot, StoreError> {
            std::future::pending().await
        }

        async fn reset(&self, _key: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn get(&self, _key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
            std::future::pending().await
        }
    }
}
