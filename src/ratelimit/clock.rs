//! Time sources for rate limit checks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A source of epoch time in fractional seconds.
///
/// Each check reads the clock exactly once and uses that reading for all of
/// its arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock time that never steps backwards within this process.
#[derive(Debug, Default)]
pub struct SystemClock {
    /// Highest reading handed out so far, in microseconds
    high_water: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let previous = self.high_water.fetch_max(micros, Ordering::SeqCst);
        micros.max(previous) as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_non_decreasing() {
        let clock = SystemClock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
        assert!(last > 1_600_000_000.0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now(), 100.0);
        clock.advance(1.5);
        assert_eq!(clock.now(), 101.5);
        clock.set(50.0);
        assert_eq!(clock.now(), 50.0);
    }
}
