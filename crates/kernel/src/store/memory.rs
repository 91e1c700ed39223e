//! In-process counter store.
//!
//! One mutex guards the whole map; every operation is O(1) apart from the
//! reaper sweep. Capacity eviction frees a batch of slots per scan, so it is
//! amortized O(1) per insert. Expired entries are treated
//! as absent on every read, so correctness never depends on reaper timing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{RateLimitStore, StoreError};
use crate::clock::{SharedClock, system_clock};

/// Hard cap on tracked keys.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// A full store frees `max_entries / EVICTION_BATCH_DIVISOR` slots at once.
const EVICTION_BATCH_DIVISOR: usize = 10;

/// Longest interval the reaper may sleep between sweeps.
pub const MAX_REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counter store held in process memory.
///
/// Clones share the same map.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    entries: Mutex<HashMap<String, Entry>>,
    clock: SharedClock,
    max_entries: usize,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self::with_options(clock, DEFAULT_MAX_ENTRIES)
    }

    /// Create a store with an explicit key cap.
    pub fn with_options(clock: SharedClock, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                entries: Mutex::new(HashMap::new()),
                clock,
                max_entries: max_entries.max(1),
            }),
        }
    }

    /// Drop every counter.
    pub fn reset(&self) {
        self.inner.entries.lock().clear();
    }

    /// Number of entries in the map, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Start the background reaper.
    ///
    /// The task holds only a weak reference and exits once every handle to
    /// the store is dropped. `interval` is clamped to [`MAX_REAP_INTERVAL`].
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let interval = interval.clamp(Duration::from_millis(10), MAX_REAP_INTERVAL);
        let weak: Weak<MemoryStoreInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("rate limit store dropped, reaper exiting");
                    return;
                };
                let removed = inner.purge_expired();
                if removed > 0 {
                    debug!(removed, "reaped expired rate limit counters");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Free room for new keys.
    ///
    /// Expired entries go first. If that leaves the map within one batch of
    /// the cap, the live entries closest to expiry are dropped until a full
    /// batch is free; they have the least quota left to protect. Freeing a
    /// batch at a time keeps the scan off the per-insert path.
    fn make_room(entries: &mut HashMap<String, Entry>, now: Instant, max_entries: usize) {
        let target = max_entries - (max_entries / EVICTION_BATCH_DIVISOR).max(1);

        entries.retain(|_, entry| entry.is_live(now));
        if entries.len() <= target {
            return;
        }

        let excess = entries.len() - target;
        let mut by_expiry: Vec<(Instant, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect();
        by_expiry.select_nth_unstable_by_key(excess - 1, |(expires_at, _)| *expires_at);
        for (_, key) in by_expiry.into_iter().take(excess) {
            entries.remove(&key);
        }
        debug!(evicted = excess, "rate limit store full, evicted soonest-expiring counters");
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = self.inner.clock.now();
        let mut entries = self.inner.entries.lock();

        if let Some(entry) = entries.get_mut(key)
            && entry.is_live(now)
        {
            entry.count += 1;
            return Ok(entry.count);
        }

        if !entries.contains_key(key) && entries.len() >= self.inner.max_entries {
            MemoryStoreInner::make_room(&mut entries, now, self.inner.max_entries);
        }

        entries.insert(
            key.to_string(),
            Entry {
                count: 1,
                expires_at: now + window,
            },
        );
        Ok(1)
    }

    async fn get_count(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.count))
    }

    async fn get_ttl(&self, key: &str) -> Result<Duration, StoreError> {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(Duration::ZERO, |entry| {
                entry.expires_at.saturating_duration_since(now)
            }))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .field("max_entries", &self.inner.max_entries)
            .finish()
    }
}
