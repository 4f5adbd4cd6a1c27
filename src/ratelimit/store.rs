//! Counter store trait for abstracting local and shared backends.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a counter store backend.
///
/// Both variants mean the same thing to the rate limiter: the store could
/// not give an answer, and the configured fail-open/fail-closed policy
/// applies.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or returned an error.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured deadline.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// The state of a counter immediately after an operation on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Number of hits recorded in the current window.
    pub count: u64,
    /// Time left until the window expires and the counter resets.
    pub expires_in: Duration,
}

/// Trait for counter store implementations.
///
/// Implementations must make `increment` atomic per key: concurrent callers
/// for the same key never lose or double-count an update. The application
/// layer never reads-then-writes a counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, creating it with a TTL of `window`
    /// if absent, and return the post-increment state.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError>;

    /// Clear the counter for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Read the counter for `key` without modifying it.
    ///
    /// Returns `None` if no live counter exists.
    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError>;
}
