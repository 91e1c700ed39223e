//! Counter store backed by an external key-value server (Redis).
//!
//! Counters live under a prefixed key so they can share a database with
//! other data. Each increment runs one server-side script that bumps the
//! counter and arms the window only when the key has no expiry yet, so
//! repeated calls never push the expiry out and a counter left without one
//! is repaired by the next request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{Client as RedisClient, Script};

use super::{RateLimitStore, StoreError};

/// Default key prefix for rate limit counters.
pub const DEFAULT_PREFIX: &str = "flowra:ratelimit:";

/// INCR, then PEXPIRE when the key carries no expiry. Returns the count.
const INCR_WITH_EXPIRY: &str = r"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// The subset of key-value commands the store needs.
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    /// Atomically add one and return the new value. A key without a
    /// time-to-live gets `ttl`; an existing one is left alone.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Remaining time-to-live; `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Integer value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;
}

#[async_trait]
impl KeyValueClient for RedisClient {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.get_multiplexed_async_connection().await?;
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        let count: i64 = Script::new(INCR_WITH_EXPIRY)
            .key(key)
            .arg(millis)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.get_multiplexed_async_connection().await?;
        // -2: no such key, -1: key without expiry.
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.get_multiplexed_async_connection().await?;
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }
}

/// Rate limit store on a shared key-value server.
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<dyn KeyValueClient>,
    prefix: String,
}

impl RedisStore {
    /// Create a store on a Redis client with the default prefix.
    pub fn new(client: RedisClient) -> Self {
        Self::with_client(Arc::new(client))
    }

    /// Create a store on any [`KeyValueClient`].
    pub fn with_client(client: Arc<dyn KeyValueClient>) -> Self {
        Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Override the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// The key prefix in use.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let key = self.key(key);
        let count = self.client.incr_with_expiry(&key, window).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn get_count(&self, key: &str) -> Result<u64, StoreError> {
        let count = self.client.get(&self.key(key)).await?;
        Ok(count.and_then(|c| u64::try_from(c).ok()).unwrap_or(0))
    }

    async fn get_ttl(&self, key: &str) -> Result<Duration, StoreError> {
        let ttl = self.client.ttl(&self.key(key)).await?;
        Ok(ttl.unwrap_or(Duration::ZERO))
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    /// Key-value server double with Redis expiry semantics.
    struct FakeKv {
        clock: ManualClock,
        data: Mutex<HashMap<String, (i64, Option<Instant>)>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeKv {
        fn new(clock: ManualClock) -> Self {
            Self {
                clock,
                data: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(ManualClock::new())
            }
        }

        fn live(&self, key: &str) -> Option<(i64, Option<Instant>)> {
            let now = self.clock.now();
            let mut data = self.data.lock();
            match data.get(key).copied() {
                Some((_, Some(at))) if at <= now => {
                    data.remove(key);
                    None
                }
                other => other,
            }
        }

        fn check(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StoreError::Transport("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl KeyValueClient for FakeKv {
        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
            self.check()?;
            let (count, expiry) = self.live(key).unwrap_or((0, None));
            let expiry = expiry.or_else(|| Some(self.clock.now() + ttl));
            self.data.lock().insert(key.to_string(), (count + 1, expiry));
            Ok(count + 1)
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
            self.check()?;
            let now = self.clock.now();
            Ok(self
                .live(key)
                .and_then(|(_, at)| at)
                .map(|at| at.saturating_duration_since(now)))
        }

        async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
            self.check()?;
            Ok(self.live(key).map(|(count, _)| count))
        }
    }

    const WINDOW: Duration = Duration::from_secs(60);

    fn store() -> (RedisStore, Arc<FakeKv>, ManualClock) {
        let clock = ManualClock::new();
        let kv = Arc::new(FakeKv::new(clock.clone()));
        (RedisStore::with_client(kv.clone()), kv, clock)
    }

    #[tokio::test]
    async fn keys_carry_default_prefix() {
        let (store, kv, _clock) = store();
        store.increment("ip:10.0.0.1", WINDOW).await.unwrap();
        assert!(kv.data.lock().contains_key("flowra:ratelimit:ip:10.0.0.1"));
    }

    #[tokio::test]
    async fn custom_prefix_is_used() {
        let (store, kv, _clock) = store();
        let store = store.with_prefix("test:");
        store.increment("global", WINDOW).await.unwrap();
        assert_eq!(store.prefix(), "test:");
        assert!(kv.data.lock().contains_key("test:global"));
    }

    #[tokio::test]
    async fn window_is_fixed_from_first_increment() {
        let (store, _kv, clock) = store();
        store.increment("k", WINDOW).await.unwrap();
        clock.advance(Duration::from_secs(45));
        assert_eq!(store.increment("k", WINDOW).await.unwrap(), 2);
        assert_eq!(store.get_ttl("k").await.unwrap(), Duration::from_secs(15));

        clock.advance(Duration::from_secs(15));
        assert_eq!(store.get_count("k").await.unwrap(), 0);
        assert_eq!(store.increment("k", WINDOW).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn increment_counts_and_arms_window_in_one_call() {
        let (store, kv, _clock) = store();
        assert_eq!(store.increment("k", WINDOW).await.unwrap(), 1);
        assert_eq!(kv.calls.load(Ordering::SeqCst), 1);

        let (count, expiry) = kv.data.lock()["flowra:ratelimit:k"];
        assert_eq!(count, 1);
        assert!(expiry.is_some());
    }

    #[tokio::test]
    async fn missing_expiry_is_repaired() {
        let (store, kv, _clock) = store();
        // A counter written without an expiry.
        kv.data
            .lock()
            .insert("flowra:ratelimit:k".to_string(), (3, None));

        assert_eq!(store.increment("k", WINDOW).await.unwrap(), 4);
        assert_eq!(store.get_ttl("k").await.unwrap(), WINDOW);
    }

    #[tokio::test]
    async fn transport_errors_surface() {
        let store = RedisStore::with_client(Arc::new(FakeKv::failing()));
        let err = store.increment("k", WINDOW).await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }
}
