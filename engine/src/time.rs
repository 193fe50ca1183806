//! Wall-clock sources.
//!
//! Wall time is only ever used for last-writer-wins tie-breaking and for
//! human-readable metadata. Causality is tracked by [`crate::VectorClock`].

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait WallClock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> Timestamp;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// A manually driven wall clock.
///
/// Clones share the same underlying time, so a test (or a replaying host) can
/// hand one clone to a replica and keep another to advance it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a manual clock starting at the given time.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared handle to a wall clock.
pub type SharedWallClock = Arc<dyn WallClock>;

/// The default wall clock used when none is injected.
pub fn system_clock() -> SharedWallClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1000);
        let handle = clock.clone();
        handle.advance(10);
        assert_eq!(clock.now_millis(), 1010);
        clock.set(5);
        assert_eq!(handle.now_millis(), 5);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
