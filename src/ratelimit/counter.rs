//! In-process counter store implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::rules::MAX_WINDOW;
use super::store::{CounterSnapshot, CounterStore, StoreError};

/// A counter for a single rate limit key.
#[derive(Debug, Clone, Copy)]
pub struct CounterEntry {
    /// Hits recorded in the current window
    pub count: u64,
    /// When the current window ends
    pub expires_at: Instant,
}

impl CounterEntry {
    fn new(window: Duration, now: Instant) -> Self {
        // Windows are bounded by validation; clamp for stores used directly.
        let window = window.min(MAX_WINDOW);
        Self {
            count: 0,
            expires_at: now.checked_add(window).unwrap_or(now),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn snapshot(&self, now: Instant) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count,
            expires_in: self.expires_at.saturating_duration_since(now),
        }
    }
}

/// A counter store held in process memory.
///
/// Counters are sharded across a `DashMap`; each increment runs under the
/// shard's write lock, so updates to one key are serialized without a
/// global lock. Expired counters are reset on next access and removed by
/// [`MemoryCounterStore::purge_expired`].
///
/// Uses `tokio::time::Instant` so window expiry follows the runtime clock.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, CounterEntry>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every counter whose window has ended.
    ///
    /// Returns the number of counters removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, "Purged expired rate limit counters");
        }
        removed
    }

    /// Get the number of live counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Spawn a task that purges expired counters every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::new(window, now));

        if entry.is_expired(now) {
            trace!(key, "Window expired, resetting counter");
            *entry = CounterEntry::new(window, now);
        }

        entry.count += 1;
        Ok(entry.snapshot(now))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.snapshot(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_increment_creates_counter() {
        let store = MemoryCounterStore::new();

        let snapshot = store.increment("k", WINDOW).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.expires_in, WINDOW);
        assert_eq!(store.counter_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_keeps_window_start() {
        let store = MemoryCounterStore::new();

        store.increment("k", WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let snapshot = store.increment("k", WINDOW).await.unwrap();

        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.expires_in, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_window_is_clamped() {
        let store = MemoryCounterStore::new();

        let snapshot = store.increment("k", Duration::MAX).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.expires_in, MAX_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_resets_after_window() {
        let store = MemoryCounterStore::new();

        for _ in 0..3 {
            store.increment("k", WINDOW).await.unwrap();
        }
        tokio::time::advance(WINDOW).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        let snapshot = store.increment("k", WINDOW).await.unwrap();
        assert_eq!(snapshot.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_counter() {
        let store = MemoryCounterStore::new();

        store.increment("k", WINDOW).await.unwrap();
        store.reset("k").await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::new();

        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.counter_count(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    store.increment("shared", WINDOW).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = store.get("shared").await.unwrap().unwrap();
        assert_eq!(snapshot.count, 2000);
    }
}
