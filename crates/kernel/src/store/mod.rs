//! Counter storage for rate limiting.
//!
//! A store keeps one fixed-window counter per key. The window starts on the
//! first increment and is never extended by later increments; once it lapses
//! the key reads as absent and the next increment opens a fresh window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{DEFAULT_PREFIX, KeyValueClient, RedisStore};

/// Store failures. Callers treat every variant as non-fatal for the request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Transport(e.to_string())
    }
}

/// Atomic fixed-window counters keyed by string.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Add one to `key` and return the new count.
    ///
    /// An absent or expired key starts over at 1 with a window of `window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Current count, or 0 when the key is absent or expired.
    async fn get_count(&self, key: &str) -> Result<u64, StoreError>;

    /// Time left in the key's window, or zero when absent or expired.
    async fn get_ttl(&self, key: &str) -> Result<Duration, StoreError>;
}

/// Store handle shared by every limiter in the chain.
pub type SharedStore = Arc<dyn RateLimitStore>;

/// Run a store operation with a deadline.
///
/// An elapsed deadline drops the in-flight future, which cancels its I/O.
pub async fn with_deadline<T, F>(deadline: Duration, op: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}
