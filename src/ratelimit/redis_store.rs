//! Redis-backed counter store.
//!
//! Counters live in Redis so every gateway instance pointed at the same
//! server shares one window per key. Atomicity comes from running the
//! increment and the expiry in a single Lua script.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::Script;
use tracing::{debug, info};

use super::store::{CounterSnapshot, CounterStore, StoreError};

/// Lua script: fixed window increment.
///
/// - KEYS[1]: counter key
/// - ARGV[1]: window length in milliseconds
///
/// Returns `{count, ttl_ms}`. The expiry is set when the counter is created
/// and repaired if a key somehow lost its TTL.
static INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end

return {current, ttl}
"#;

/// Lua script: read a counter and its remaining TTL together.
///
/// Returns `{count or nil, ttl_ms}`.
static READ_SCRIPT: &str = r#"
return {redis.call('GET', KEYS[1]), redis.call('PTTL', KEYS[1])}
"#;

/// A counter store backed by a Redis server.
///
/// Generic over the connection so it can run on a [`ConnectionManager`]
/// in production and on any other async connection elsewhere.
#[derive(Clone)]
pub struct RedisCounterStore<C = ConnectionManager> {
    conn: C,
    increment_script: Script,
    read_script: Script,
}

impl<C> RedisCounterStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Create a store over an established connection.
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            increment_script: Script::new(INCREMENT_SCRIPT),
            read_script: Script::new(READ_SCRIPT),
        }
    }
}

impl RedisCounterStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counter store");
        Ok(Self::new(conn))
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn snapshot_from_reply(count: i64, ttl_ms: i64) -> CounterSnapshot {
    CounterSnapshot {
        count: count.max(0) as u64,
        expires_in: Duration::from_millis(ttl_ms.max(0) as u64),
    }
}

#[async_trait]
impl<C> CounterStore for RedisCounterStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.conn.clone();

        let values: Vec<i64> = self
            .increment_script
            .key(key)
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await?;

        let [count, ttl_ms] = values[..] else {
            return Err(StoreError::Unavailable(format!(
                "unexpected increment script reply length: {}",
                values.len()
            )));
        };

        debug!(key, count, ttl_ms, "Redis counter incremented");
        Ok(snapshot_from_reply(count, ttl_ms))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        let mut conn = self.conn.clone();
        let (count, ttl_ms): (Option<i64>, i64) = self
            .read_script
            .key(key)
            .invoke_async(&mut conn)
            .await?;

        Ok(count.map(|count| snapshot_from_reply(count, ttl_ms)))
    }
}
