//! Time sources for rate-limit windows.
//!
//! Window arithmetic runs on a monotonic [`Instant`]; the wall clock is only
//! consulted to render `X-RateLimit-Reset`. Both come from the same [`Clock`]
//! so tests can move them together.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

/// Source of "now".
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant used for expiry checks.
    fn now(&self) -> Instant;

    /// Wall-clock time used for reset headers.
    fn system_now(&self) -> SystemTime;
}

/// Clock handle shared between stores and limiters.
pub type SharedClock = Arc<dyn Clock>;

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Create the default shared clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when [`ManualClock::advance`] is called.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

#[derive(Debug)]
struct ManualClockInner {
    base: Instant,
    base_system: SystemTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManualClockInner {
                base: Instant::now(),
                base_system: SystemTime::now(),
                offset: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.inner.offset.lock() += by;
    }

    /// Share this clock as a [`SharedClock`]. Clones observe the same time.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.base + *self.inner.offset.lock()
    }

    fn system_now(&self) -> SystemTime {
        self.inner.base_system + *self.inner.offset.lock()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        let first = clock.now();
        assert_eq!(clock.now(), first);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - first, Duration::from_millis(1500));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let shared = clock.shared();
        let before = shared.system_now();

        clock.advance(Duration::from_secs(60));
        assert_eq!(
            shared.system_now().duration_since(before).unwrap(),
            Duration::from_secs(60)
        );
    }
}
