//! Time sources for the limiter stores.
//!
//! Stores never read the system clock directly. They take a [`Clock`] so tests
//! can drive time by hand.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// A source of "now", expressed as the time elapsed since a clock-defined epoch.
pub trait Clock: Send + Sync + Debug {
    /// The current time.
    fn now(&self) -> Duration;
}

/// Monotonic clock anchored at construction. Default for the in-memory store.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.anchor.elapsed()
    }
}

/// Wall clock measured from the Unix epoch.
///
/// The distributed store uses this because every process sharing a Redis key
/// must agree on the timeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to a
/// store and advance another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<RwLock<Duration>>,
}

impl ManualClock {
    /// Create a clock starting at `start`.
    pub fn new(start: Duration) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Duration) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.read()
    }
}
