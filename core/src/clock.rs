//! Monotonic time sources
//!
//! All timestamps in the pool are seconds (`f64`) relative to a clock anchor.
//! Anchoring on `Instant` keeps cooldowns and recovery backoffs immune to
//! wall-clock adjustments from NTP.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Source of monotonic time for cooldown and recovery scheduling
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds elapsed since the clock anchor
    fn now(&self) -> f64;
}

/// Clock backed by `Instant`, anchored at creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for deterministic tests and simulations
///
/// # Example
///
/// ```rust
/// use pool_machines::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(clock.now(), 60.0);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::at(0.0)
    }

    /// Create a clock frozen at the given number of seconds
    pub fn at(seconds: f64) -> Self {
        Self {
            now: Mutex::new(seconds),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time; going backwards is ignored
    pub fn set(&self, seconds: f64) {
        let mut now = self.now.lock();
        if seconds > *now {
            *now = seconds;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
