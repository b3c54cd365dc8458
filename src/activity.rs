//! Activity tracking for idle-session reclamation.
//!
//! Each mapper owns one [`ActivityRecorder`]; the pumps refresh it whenever
//! data actually moved, and the idle sweeper / reaper queries it on a timer.
//! The two timestamps are independent atomics: a reader may observe one of
//! them a refresh behind, which only ever delays reclamation by a tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic last-read / last-write timestamps shared across pumps.
#[derive(Debug)]
pub struct ActivityRecorder {
    base: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl ActivityRecorder {
    /// Creates a recorder with both timestamps set to now.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    /// Marks read-direction activity.
    pub fn refresh_read(&self) {
        self.last_read_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Marks write-direction activity.
    pub fn refresh_write(&self) {
        self.last_write_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// True when neither direction has seen activity within `threshold`.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        let now = self.now_ms();
        let threshold = threshold.as_millis() as u64;
        let read_age = now.saturating_sub(self.last_read_ms.load(Ordering::Relaxed));
        let write_age = now.saturating_sub(self.last_write_ms.load(Ordering::Relaxed));
        read_age > threshold && write_age > threshold
    }
}

impl Default for ActivityRecorder {
    fn default() -> Self {
        Self::new()
    }
}
