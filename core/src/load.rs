//! Lock-free concurrent holder accounting
//!
//! Each credential carries a `LoadGauge` counting how many sessions currently
//! hold it. Increments and decrements are compare-and-swap loops, so the
//! count never leaves `[0, capacity]` no matter how calls interleave.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded counter of concurrent holders for one credential
#[derive(Debug)]
pub struct LoadGauge {
    /// Maximum number of concurrent holders
    capacity: usize,
    /// Current number of holders
    load: AtomicUsize,
}

impl LoadGauge {
    /// Create a gauge for the given capacity
    ///
    /// Capacity is validated by the registry before a gauge is created.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            load: AtomicUsize::new(0),
        }
    }

    /// Try to take one slot without blocking
    ///
    /// Returns the load after the increment, or `None` at capacity.
    pub fn try_acquire(&self) -> Option<usize> {
        let mut current = self.load.load(Ordering::Acquire);

        loop {
            if current >= self.capacity {
                return None;
            }

            match self.load.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Give one slot back
    ///
    /// Returns the load after the decrement, or `None` when the gauge was
    /// already empty (the call is clamped to a no-op).
    pub fn release(&self) -> Option<usize> {
        let mut current = self.load.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return None;
            }

            match self.load.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Current number of holders
    pub fn current(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.current())
    }

    pub fn is_full(&self) -> bool {
        self.current() >= self.capacity
    }

    /// Fraction of capacity in use (0.0..=1.0)
    pub fn usage_ratio(&self) -> f64 {
        self.current() as f64 / self.capacity.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_gauge_basic_acquire_release() {
        let gauge = LoadGauge::new(3);

        assert_eq!(gauge.capacity(), 3);
        assert_eq!(gauge.current(), 0);
        assert_eq!(gauge.available(), 3);

        assert_eq!(gauge.try_acquire(), Some(1));
        assert_eq!(gauge.try_acquire(), Some(2));
        assert_eq!(gauge.available(), 1);

        assert_eq!(gauge.release(), Some(1));
        assert_eq!(gauge.release(), Some(0));
        assert_eq!(gauge.available(), 3);
    }

    #[test]
    fn test_gauge_at_capacity() {
        let gauge = LoadGauge::new(2);

        gauge.try_acquire().expect("Should acquire");
        gauge.try_acquire().expect("Should acquire");

        assert!(gauge.try_acquire().is_none(), "Should not exceed capacity");
        assert!(gauge.is_full());
        assert_eq!(gauge.usage_ratio(), 1.0);

        gauge.release();
        assert!(gauge.try_acquire().is_some(), "Should acquire after release");
    }

    #[test]
    fn test_gauge_release_is_clamped() {
        let gauge = LoadGauge::new(2);

        gauge.try_acquire();
        assert_eq!(gauge.release(), Some(0));
        assert_eq!(gauge.release(), None);
        assert_eq!(gauge.release(), None);
        assert_eq!(gauge.current(), 0);
    }

    #[test]
    fn test_gauge_concurrent_access_never_overshoots() {
        let gauge = Arc::new(LoadGauge::new(5));
        let mut handles = vec![];

        for _ in 0..16 {
            let gauge = Arc::clone(&gauge);
            handles.push(thread::spawn(move || {
                let mut acquired = 0;
                for _ in 0..1000 {
                    if gauge.try_acquire().is_some() {
                        assert!(gauge.current() <= 5);
                        acquired += 1;
                        gauge.release();
                    }
                }
                acquired
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert!(total > 0);
        assert_eq!(gauge.current(), 0);
    }

    #[test]
    fn test_gauge_concurrent_over_release() {
        let gauge = Arc::new(LoadGauge::new(4));
        for _ in 0..4 {
            gauge.try_acquire();
        }

        let mut handles = vec![];
        for _ in 0..8 {
            let gauge = Arc::clone(&gauge);
            handles.push(thread::spawn(move || gauge.release().is_some()));
        }

        let released = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r)
            .count();

        assert_eq!(released, 4);
        assert_eq!(gauge.current(), 0);
    }
}
