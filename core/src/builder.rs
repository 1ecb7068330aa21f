//! Builder API for ergonomic pool configuration

use crate::{
    Clock, MonotonicClock,
    allocator::PoolAllocator,
    config::{CredentialConfig, PoolConfig},
    errors::PoolError,
    events::{CallbackSink, EventSink, PoolEvent},
    health::HealthMonitor,
    storage::OutcomeStore,
};
use std::sync::Arc;

/// Builder for creating credential pools with fluent API
pub struct PoolBuilder {
    config: PoolConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn OutcomeStore>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    /// Create a new builder with default settings and no credentials
    pub fn new() -> Self {
        Self::from_config(PoolConfig::default())
    }

    /// Start from a loaded configuration
    pub fn from_config(config: PoolConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            sink: None,
        }
    }

    /// Set the pool-level error count that starts a cooldown
    pub fn error_threshold(mut self, threshold: u32) -> Self {
        self.config.error_threshold = threshold;
        self
    }

    /// Set the fixed cooldown length in seconds
    pub fn cooldown_secs(mut self, seconds: f64) -> Self {
        self.config.cooldown_secs = seconds;
        self
    }

    /// Set consecutive failures that quarantine a credential
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.health.failure_threshold = threshold;
        self
    }

    /// Set consecutive successes needed to leave probation
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.health.success_threshold = threshold;
        self
    }

    /// Set the number of outcomes kept per credential
    ///
    /// Sizes the default in-memory store only. A store passed to
    /// [`PoolBuilder::store`] keeps its own window size.
    pub fn window_size(mut self, size: usize) -> Self {
        self.config.health.window_size = size;
        self
    }

    /// Set samples required before the success rate drives health
    pub fn minimum_samples(mut self, samples: usize) -> Self {
        self.config.health.minimum_samples = samples;
        self
    }

    /// Set the first quarantine backoff and its cap, in seconds
    pub fn backoff_secs(mut self, base: f64, max: f64) -> Self {
        self.config.health.base_backoff_secs = base;
        self.config.health.max_backoff_secs = max;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: backoff * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.health.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Set the period of the background recovery scan
    pub fn recovery_interval_secs(mut self, seconds: f64) -> Self {
        self.config.health.recovery_interval_secs = seconds;
        self
    }

    /// Register a credential at build time
    pub fn credential(mut self, credential: CredentialConfig) -> Self {
        self.config.credentials.push(credential);
        self
    }

    /// Set the time source (a `ManualClock` in tests)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set custom outcome storage
    ///
    /// The store is used as given, so `window_size` has no effect on it.
    /// Build a `MemoryOutcomeStore` with `with_window_size` to bound it.
    pub fn store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the observer for pool events
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set a callback for every pool event
    pub fn on_event<F>(self, f: F) -> Self
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.event_sink(Arc::new(CallbackSink::new(f)))
    }

    /// Build the allocator and load the configured credentials
    pub fn build(self) -> Result<PoolAllocator, PoolError> {
        let health = &self.config.health;
        if health.failure_threshold == 0 || health.success_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "failure and success thresholds must be greater than 0".to_string(),
            ));
        }
        if health.window_size == 0 {
            return Err(PoolError::InvalidConfig(
                "window size must be greater than 0".to_string(),
            ));
        }
        if !(self.config.cooldown_secs.is_finite() && self.config.cooldown_secs >= 0.0) {
            return Err(PoolError::InvalidConfig(format!(
                "invalid cooldown {}",
                self.config.cooldown_secs
            )));
        }
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let mut monitor = HealthMonitor::new(self.config.health.clone(), Arc::clone(&clock));
        if let Some(store) = self.store {
            monitor = monitor.with_store(store);
        }
        if let Some(sink) = &self.sink {
            monitor = monitor.with_event_sink(Arc::clone(sink));
        }

        let allocator =
            PoolAllocator::from_parts(&self.config, Arc::new(monitor), clock, self.sink);
        allocator.initialize(&self.config.credentials)?;
        Ok(allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, MemoryOutcomeStore};
    use parking_lot::Mutex;

    #[test]
    fn test_builder_defaults() {
        let pool = PoolBuilder::new().build().unwrap();

        let stats = pool.get_stats();
        assert_eq!(stats.total, 0);
        assert_eq!(pool.health().config().failure_threshold, 3);
    }

    #[test]
    fn test_builder_custom_config() {
        let pool = PoolBuilder::new()
            .error_threshold(2)
            .cooldown_secs(10.0)
            .failure_threshold(10)
            .success_threshold(2)
            .window_size(20)
            .minimum_samples(10)
            .backoff_secs(5.0, 50.0)
            .jitter_factor(3.0)
            .recovery_interval_secs(1.0)
            .credential(CredentialConfig::new("key-a"))
            .build()
            .unwrap();

        let config = pool.health().config();
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.window_size, 20);
        assert_eq!(config.base_backoff_secs, 5.0);
        assert_eq!(config.jitter_factor, 1.0);
        assert_eq!(config.recovery_interval_secs, 1.0);

        pool.report_error("key-a", "boom");
        pool.report_error("key-a", "boom");
        assert_eq!(
            pool.credential("key-a").unwrap().status,
            crate::CredentialStatus::Cooldown
        );
    }

    #[test]
    fn test_builder_rejects_invalid_credentials() {
        let result = PoolBuilder::new()
            .credential(CredentialConfig::new("key-a"))
            .credential(CredentialConfig::new("key-a"))
            .build();
        assert!(matches!(result, Err(PoolError::DuplicateCredential { .. })));

        let result = PoolBuilder::new()
            .credential(CredentialConfig::new("key-a").capacity(0))
            .build();
        assert!(matches!(result, Err(PoolError::InvalidCapacity { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_thresholds() {
        let result = PoolBuilder::new().failure_threshold(0).build();
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));

        let result = PoolBuilder::new().window_size(0).build();
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_shares_clock_and_store() {
        let clock = Arc::new(ManualClock::at(42.0));
        let store = Arc::new(MemoryOutcomeStore::new());
        let pool = PoolBuilder::new()
            .clock(clock.clone())
            .store(store.clone())
            .credential(CredentialConfig::new("key-a"))
            .build()
            .unwrap();

        pool.report_error("key-a", "boom");

        assert_eq!(store.sample_count("key-a"), 1);
        assert_eq!(
            pool.get_credential_health("key-a").unwrap().last_failure_at,
            Some(42.0)
        );
    }

    #[test]
    fn test_custom_store_keeps_its_own_window() {
        let store = Arc::new(MemoryOutcomeStore::with_window_size(3));
        let pool = PoolBuilder::new()
            .window_size(50)
            .store(store.clone())
            .credential(CredentialConfig::new("key-a"))
            .build()
            .unwrap();

        for _ in 0..5 {
            pool.report_error("key-a", "boom");
        }

        assert_eq!(store.window_size(), 3);
        assert_eq!(store.sample_count("key-a"), 3);
        assert_eq!(pool.get_credential_health("key-a").unwrap().samples, 3);
        assert_eq!(pool.health().config().window_size, 50);
    }

    #[test]
    fn test_builder_with_event_callback() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let pool = PoolBuilder::new()
            .credential(CredentialConfig::new("key-a"))
            .on_event(move |event: &PoolEvent| {
                events_clone.lock().push(event.clone());
            })
            .build()
            .unwrap();

        pool.allocate(None).unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "credential.added");
        assert_eq!(events[1].kind(), "credential.allocated");
    }
}
