//! Time source for batch ages, coalesce timeouts and ledger timestamps.
//!
//! Nothing in the engine reads the wall clock directly. Readings are offsets
//! from an arbitrary per-clock origin, which is all trigger and barrier
//! arithmetic needs; the ledger anchors them to the wall time it was opened.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub trait Clock: Debug + Send + Sync {
    /// Monotonic time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

/// Monotonic clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to. Millisecond resolution; readings
/// saturate at `u64::MAX` milliseconds.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let by = saturating_millis(by);
        let _ = self
            .millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| Some(m.saturating_add(by)));
    }

    pub fn set(&self, to: Duration) {
        self.millis.store(saturating_millis(to), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
