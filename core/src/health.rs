//! Credential health tracking using state machines
//!
//! Every credential gets a health record driven by a dynamic state machine:
//!
//! ```text
//! Unknown ──> Healthy <──> Degraded ──> Unhealthy ──> Recovering ──> Healthy
//!    │           │                         ^              │
//!    └───────────┴─────────────────────────┘──────────────┘
//! ```
//!
//! Failures and successes are appended to the credential's outcome window.
//! Three consecutive failures quarantine a credential (`Unhealthy`) with an
//! exponential backoff; only the recovery scan moves it on to `Recovering`,
//! where five consecutive successes restore full trust. Outside quarantine and
//! probation the status follows the windowed success rate.

use crate::{
    Clock, MonotonicClock, Outcome,
    events::{EventSink, PoolEvent},
    storage::{DEFAULT_WINDOW_SIZE, MemoryOutcomeStore, OutcomeStore},
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Health tracking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that quarantine a credential
    pub failure_threshold: u32,

    /// Consecutive successes in `Recovering` required to become `Healthy`
    pub success_threshold: u32,

    /// Number of outcomes kept in the sliding window
    pub window_size: usize,

    /// Samples required before the success rate drives the status
    pub minimum_samples: usize,

    /// Success rate (percent) below which a credential is `Degraded`
    pub degraded_below: f64,

    /// Success rate (percent) below which a credential is `Unhealthy`
    pub unhealthy_below: f64,

    /// Backoff for the first quarantine, doubled per further attempt
    pub base_backoff_secs: f64,

    /// Upper bound for the quarantine backoff
    pub max_backoff_secs: f64,

    /// Jitter factor for the backoff (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: backoff * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Period of the background recovery scan
    pub recovery_interval_secs: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 5,
            window_size: DEFAULT_WINDOW_SIZE,
            minimum_samples: 5,
            degraded_below: 70.0,
            unhealthy_below: 50.0,
            base_backoff_secs: 60.0,
            max_backoff_secs: 3600.0,
            jitter_factor: 0.0,
            recovery_interval_secs: 60.0,
        }
    }
}

impl HealthConfig {
    /// Quarantine length for a credential that has already been quarantined
    /// `recovery_attempts` times without fully recovering
    pub fn backoff_secs(&self, recovery_attempts: u32) -> f64 {
        let exponent = recovery_attempts.min(32) as i32;
        let backoff = (self.base_backoff_secs * 2f64.powi(exponent)).min(self.max_backoff_secs);

        if self.jitter_factor > 0.0 {
            let backoff_ms = (backoff * 1000.0) as u64;
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: backoff_ms,
                multiplier: 1.0,
                max_delay_ms: backoff_ms,
            };
            let delay_ms = policy.calculate_delay(1, self.jitter_factor);
            (delay_ms as f64) / 1000.0
        } else {
            backoff
        }
    }
}

/// Health status of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No evidence yet; treated as usable
    #[default]
    Unknown,
    Healthy,
    /// Success rate below 70%
    Degraded,
    /// Quarantined until the recovery backoff elapses
    Unhealthy,
    /// On probation after quarantine
    Recovering,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Recovering => "recovering",
        }
    }

    /// Whether the credential may be handed out without falling back
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            HealthStatus::Unknown | HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    fn from_state_name(name: &str) -> Self {
        match name {
            "Healthy" => HealthStatus::Healthy,
            "Degraded" => HealthStatus::Degraded,
            "Unhealthy" => HealthStatus::Unhealthy,
            "Recovering" => HealthStatus::Recovering,
            _ => HealthStatus::Unknown,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health machine context - shared data across all states
#[derive(Clone)]
pub struct HealthContext {
    pub credential_id: String,
    pub config: HealthConfig,
    pub store: Arc<dyn OutcomeStore>,
    pub clock: Arc<dyn Clock>,
}

impl Default for HealthContext {
    fn default() -> Self {
        Self {
            credential_id: String::new(),
            config: HealthConfig::default(),
            store: Arc::new(MemoryOutcomeStore::new()),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl std::fmt::Debug for HealthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthContext")
            .field("credential_id", &self.credential_id)
            .field("config", &self.config)
            .field("store", &"<dyn OutcomeStore>")
            .field("clock", &"<dyn Clock>")
            .finish()
    }
}

/// Data specific to the Unhealthy state
#[derive(Debug, Clone, Default)]
pub struct QuarantineData {
    pub quarantined_at: f64,
    pub next_recovery_eligible_at: f64,
}

state_machine! {
    name: Health,
    context: HealthContext,
    dynamic: true,

    initial: Unknown,
    states: [
        Unknown,
        Healthy,
        Degraded,
        Unhealthy(QuarantineData),
        Recovering,
    ],
    events {
        quarantine {
            guards: [should_quarantine],
            transition: { from: [Unknown, Healthy, Degraded, Recovering], to: Unhealthy }
        }
        degrade {
            guards: [rate_degraded],
            transition: { from: [Unknown, Healthy], to: Degraded }
        }
        promote {
            guards: [rate_healthy],
            transition: { from: [Unknown, Degraded], to: Healthy }
        }
        begin_recovery {
            guards: [backoff_elapsed],
            transition: { from: Unhealthy, to: Recovering }
        }
        recover {
            guards: [probation_passed],
            transition: { from: Recovering, to: Healthy }
        }
    }
}

fn failure_threshold_reached(ctx: &HealthContext) -> bool {
    ctx.store.consecutive_failures(&ctx.credential_id) >= ctx.config.failure_threshold
}

/// Status implied by the windowed success rate, once enough samples exist
fn rate_band(ctx: &HealthContext) -> Option<HealthStatus> {
    if ctx.store.sample_count(&ctx.credential_id) < ctx.config.minimum_samples.max(1) {
        return None;
    }

    let rate = ctx.store.success_rate(&ctx.credential_id)?;
    let band = if rate < ctx.config.unhealthy_below {
        HealthStatus::Unhealthy
    } else if rate < ctx.config.degraded_below {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    Some(band)
}

// Guards for dynamic mode - implemented on typestate machines
impl Health<Unknown> {
    fn should_quarantine(&self, ctx: &HealthContext) -> bool {
        failure_threshold_reached(ctx) || rate_band(ctx) == Some(HealthStatus::Unhealthy)
    }

    fn rate_degraded(&self, ctx: &HealthContext) -> bool {
        rate_band(ctx) == Some(HealthStatus::Degraded)
    }

    fn rate_healthy(&self, ctx: &HealthContext) -> bool {
        rate_band(ctx) == Some(HealthStatus::Healthy)
    }
}

impl Health<Healthy> {
    fn should_quarantine(&self, ctx: &HealthContext) -> bool {
        failure_threshold_reached(ctx) || rate_band(ctx) == Some(HealthStatus::Unhealthy)
    }

    fn rate_degraded(&self, ctx: &HealthContext) -> bool {
        rate_band(ctx) == Some(HealthStatus::Degraded)
    }
}

impl Health<Degraded> {
    fn should_quarantine(&self, ctx: &HealthContext) -> bool {
        failure_threshold_reached(ctx) || rate_band(ctx) == Some(HealthStatus::Unhealthy)
    }

    fn rate_healthy(&self, ctx: &HealthContext) -> bool {
        rate_band(ctx) == Some(HealthStatus::Healthy)
    }
}

impl Health<Unhealthy> {
    /// Check if the quarantine backoff has elapsed
    fn backoff_elapsed(&self, ctx: &HealthContext) -> bool {
        self.state_data_unhealthy()
            .map(|data| ctx.clock.now() >= data.next_recovery_eligible_at)
            .unwrap_or(true)
    }
}

impl Health<Recovering> {
    /// Probation ignores the rolling rate; only a failure streak re-quarantines
    fn should_quarantine(&self, ctx: &HealthContext) -> bool {
        failure_threshold_reached(ctx)
    }

    fn probation_passed(&self, ctx: &HealthContext) -> bool {
        ctx.store.consecutive_successes(&ctx.credential_id) >= ctx.config.success_threshold
    }
}

/// Outcomes included in a `HealthReport`, oldest first
pub const REPORT_RECENT_OUTCOMES: usize = 10;

/// Point-in-time health view of one credential
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub credential_id: String,
    pub status: HealthStatus,
    /// Windowed success rate in percent
    pub success_rate: Option<f64>,
    pub samples: usize,
    pub average_latency_ms: Option<f64>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub next_recovery_eligible_at: Option<f64>,
    pub last_success_at: Option<f64>,
    pub last_failure_at: Option<f64>,
    pub last_error: Option<String>,
    pub recent_outcomes: Vec<Outcome>,
}

struct HealthRecord {
    machine: DynamicHealth,
    recovery_attempts: u32,
    last_error: Option<String>,
}

impl HealthRecord {
    fn status(&self) -> HealthStatus {
        HealthStatus::from_state_name(self.machine.current_state())
    }

    fn next_recovery_eligible_at(&self) -> Option<f64> {
        self.machine
            .unhealthy_data()
            .map(|data| data.next_recovery_eligible_at)
    }
}

/// Per-credential health tracker and quarantine scheduler
///
/// Records are created lazily on the first reported outcome. Each record sits
/// behind its own lock, so traffic on one credential never serializes another.
///
/// # Example
///
/// ```rust
/// use pool_machines::{HealthConfig, HealthMonitor, HealthStatus, ManualClock};
/// use std::sync::Arc;
///
/// let clock = Arc::new(ManualClock::new());
/// let monitor = HealthMonitor::new(HealthConfig::default(), clock);
///
/// for _ in 0..3 {
///     monitor.record_failure("key-a", Some("429 Too Many Requests"));
/// }
/// assert_eq!(monitor.status("key-a"), HealthStatus::Unhealthy);
/// assert!(!monitor.is_healthy("key-a"));
/// ```
pub struct HealthMonitor {
    config: HealthConfig,
    store: Arc<dyn OutcomeStore>,
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, Arc<Mutex<HealthRecord>>>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl HealthMonitor {
    /// Create a monitor with an in-memory outcome store sized from `config`
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(MemoryOutcomeStore::with_window_size(config.window_size));
        Self {
            config,
            store,
            clock,
            records: RwLock::new(HashMap::new()),
            sink: None,
        }
    }

    /// Replace the outcome store
    ///
    /// The store keeps its own window size; `HealthConfig::window_size` only
    /// sizes the default in-memory store.
    pub fn with_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.store = store;
        self
    }

    /// Publish `credential.healthChanged` events to a sink
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn OutcomeStore> {
        &self.store
    }

    fn record(&self, credential_id: &str) -> Arc<Mutex<HealthRecord>> {
        if let Some(record) = self.records.read().get(credential_id) {
            return Arc::clone(record);
        }

        let mut records = self.records.write();
        Arc::clone(records.entry(credential_id.to_string()).or_insert_with(|| {
            let context = HealthContext {
                credential_id: credential_id.to_string(),
                config: self.config.clone(),
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
            };
            Arc::new(Mutex::new(HealthRecord {
                machine: DynamicHealth::new(context),
                recovery_attempts: 0,
                last_error: None,
            }))
        }))
    }

    fn existing(&self, credential_id: &str) -> Option<Arc<Mutex<HealthRecord>>> {
        self.records.read().get(credential_id).cloned()
    }

    /// Record a failed use of a credential and return its new status
    pub fn record_failure(&self, credential_id: &str, message: Option<&str>) -> HealthStatus {
        let record = self.record(credential_id);
        let mut record = record.lock();

        // Append under the record lock; guards must see this outcome as the latest
        let now = self.clock.now();
        self.store.record_failure(credential_id, 0.0, now);
        let before = record.status();

        if let Some(message) = message {
            record.last_error = Some(message.to_string());
        }

        if before != HealthStatus::Unhealthy {
            if record.machine.handle(HealthEvent::Quarantine).is_ok() {
                self.mark_unhealthy(credential_id, &mut record, now);
            } else if before != HealthStatus::Recovering {
                Self::follow_rate(&mut record);
            }
        }

        let after = record.status();
        drop(record);

        self.notify(credential_id, before, after);
        after
    }

    /// Record a successful use of a credential and return its new status
    pub fn record_success(&self, credential_id: &str, latency_ms: f64) -> HealthStatus {
        let record = self.record(credential_id);
        let mut record = record.lock();

        let now = self.clock.now();
        self.store.record_success(credential_id, latency_ms, now);
        let before = record.status();

        match before {
            HealthStatus::Recovering => {
                if record.machine.handle(HealthEvent::Recover).is_ok() {
                    record.recovery_attempts = 0;
                    // Pre-quarantine failures would drag the fresh status back down
                    self.store.clear_samples(credential_id);
                }
            }
            // Only the recovery scan leaves quarantine
            HealthStatus::Unhealthy => {}
            _ => {
                if record.machine.handle(HealthEvent::Quarantine).is_ok() {
                    self.mark_unhealthy(credential_id, &mut record, now);
                } else {
                    Self::follow_rate(&mut record);
                }
            }
        }

        let after = record.status();
        drop(record);

        self.notify(credential_id, before, after);
        after
    }

    /// Move every quarantined credential whose backoff has elapsed into
    /// `Recovering`. Returns the ids that started probation.
    pub fn run_recovery_scan(&self) -> Vec<String> {
        let records: Vec<(String, Arc<Mutex<HealthRecord>>)> = self
            .records
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), Arc::clone(record)))
            .collect();

        let now = self.clock.now();
        let mut recovering = Vec::new();

        for (credential_id, record) in records {
            let mut guard = record.lock();
            if guard.status() != HealthStatus::Unhealthy
                || guard
                    .next_recovery_eligible_at()
                    .is_some_and(|eligible_at| now < eligible_at)
            {
                continue;
            }

            // A reset that panics must leave the credential Unhealthy
            self.store.reset_success_streak(&credential_id);
            if guard.machine.handle(HealthEvent::BeginRecovery).is_ok() {
                let attempts = guard.recovery_attempts;
                drop(guard);

                info!(
                    credential = %credential_id,
                    recovery_attempts = attempts,
                    "credential entered probation"
                );
                self.notify(
                    &credential_id,
                    HealthStatus::Unhealthy,
                    HealthStatus::Recovering,
                );
                recovering.push(credential_id);
            }
        }

        recovering
    }

    /// Current status; credentials without outcomes are `Unknown`
    pub fn status(&self, credential_id: &str) -> HealthStatus {
        self.existing(credential_id)
            .map(|record| record.lock().status())
            .unwrap_or_default()
    }

    /// True for `Healthy`, `Degraded` and `Unknown`
    pub fn is_healthy(&self, credential_id: &str) -> bool {
        self.status(credential_id).is_usable()
    }

    /// True while a credential is on probation
    pub fn is_recovering(&self, credential_id: &str) -> bool {
        self.status(credential_id) == HealthStatus::Recovering
    }

    pub fn recovery_attempts(&self, credential_id: &str) -> u32 {
        self.existing(credential_id)
            .map(|record| record.lock().recovery_attempts)
            .unwrap_or(0)
    }

    pub fn next_recovery_eligible_at(&self, credential_id: &str) -> Option<f64> {
        self.existing(credential_id)
            .and_then(|record| record.lock().next_recovery_eligible_at())
    }

    /// Full health view of a credential
    pub fn report(&self, credential_id: &str) -> HealthReport {
        let (status, recovery_attempts, next_recovery_eligible_at, last_error) =
            match self.existing(credential_id) {
                Some(record) => {
                    let record = record.lock();
                    (
                        record.status(),
                        record.recovery_attempts,
                        record.next_recovery_eligible_at(),
                        record.last_error.clone(),
                    )
                }
                None => (HealthStatus::Unknown, 0, None, None),
            };

        let window = self.store.stats(credential_id);

        HealthReport {
            credential_id: credential_id.to_string(),
            status,
            success_rate: window.as_ref().and_then(|w| w.success_rate),
            samples: window.as_ref().map(|w| w.samples).unwrap_or(0),
            average_latency_ms: window.as_ref().and_then(|w| w.average_latency_ms),
            consecutive_successes: window.as_ref().map(|w| w.consecutive_successes).unwrap_or(0),
            consecutive_failures: window.as_ref().map(|w| w.consecutive_failures).unwrap_or(0),
            recovery_attempts,
            next_recovery_eligible_at,
            last_success_at: window.as_ref().and_then(|w| w.last_success_at),
            last_failure_at: window.as_ref().and_then(|w| w.last_failure_at),
            last_error,
            recent_outcomes: self.store.event_log(credential_id, REPORT_RECENT_OUTCOMES),
        }
    }

    /// The last `limit` outcomes recorded for a credential, oldest first
    pub fn recent_outcomes(&self, credential_id: &str, limit: usize) -> Vec<Outcome> {
        self.store.event_log(credential_id, limit)
    }

    /// Drop all health state for a removed credential
    pub fn forget(&self, credential_id: &str) {
        self.records.write().remove(credential_id);
        self.store.clear(credential_id);
        debug!(credential = %credential_id, "health record dropped");
    }

    /// Number of credentials with a health record
    pub fn tracked(&self) -> usize {
        self.records.read().len()
    }

    /// Apply quarantine bookkeeping (backoff + attempt counter)
    fn mark_unhealthy(&self, credential_id: &str, record: &mut HealthRecord, now: f64) {
        let backoff = self.config.backoff_secs(record.recovery_attempts);

        if let Some(data) = record.machine.unhealthy_data_mut() {
            data.quarantined_at = now;
            data.next_recovery_eligible_at = now + backoff;
        }
        record.recovery_attempts = record.recovery_attempts.saturating_add(1);

        warn!(
            credential = %credential_id,
            backoff_secs = backoff,
            recovery_attempts = record.recovery_attempts,
            last_error = record.last_error.as_deref().unwrap_or(""),
            "credential quarantined"
        );
    }

    /// Follow the rolling success rate between Unknown, Healthy and Degraded
    fn follow_rate(record: &mut HealthRecord) {
        if record.machine.handle(HealthEvent::Degrade).is_err() {
            let _ = record.machine.handle(HealthEvent::Promote);
        }
    }

    fn notify(&self, credential_id: &str, from: HealthStatus, to: HealthStatus) {
        if from == to {
            return;
        }

        info!(credential = %credential_id, %from, %to, "credential health changed");

        if let Some(sink) = &self.sink {
            sink.on_event(&PoolEvent::HealthChanged {
                credential_id: credential_id.to_string(),
                from,
                to,
            });
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("tracked", &self.tracked())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallbackSink, ManualClock, OutcomeKind, storage::testing::HookedStore};
    use std::sync::{OnceLock, Weak};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn monitor_with_clock() -> (HealthMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let monitor = HealthMonitor::new(HealthConfig::default(), clock.clone());
        (monitor, clock)
    }

    fn quarantine(monitor: &HealthMonitor, id: &str) {
        for _ in 0..3 {
            monitor.record_failure(id, Some("rate limited"));
        }
    }

    #[test]
    fn test_new_credential_is_unknown_and_usable() {
        let (monitor, _) = monitor_with_clock();

        assert_eq!(monitor.status("key-a"), HealthStatus::Unknown);
        assert!(monitor.is_healthy("key-a"));
        assert!(!monitor.is_recovering("key-a"));
        assert_eq!(monitor.tracked(), 0);
    }

    #[test]
    fn test_single_failure_does_not_quarantine() {
        let (monitor, _) = monitor_with_clock();

        monitor.record_failure("key-a", None);
        monitor.record_failure("key-a", None);

        assert_eq!(monitor.status("key-a"), HealthStatus::Unknown);
        assert!(monitor.is_healthy("key-a"));
    }

    #[test]
    fn test_three_consecutive_failures_quarantine() {
        let (monitor, clock) = monitor_with_clock();
        clock.set(10.0);

        quarantine(&monitor, "key-a");

        assert_eq!(monitor.status("key-a"), HealthStatus::Unhealthy);
        assert!(!monitor.is_healthy("key-a"));
        assert_eq!(monitor.recovery_attempts("key-a"), 1);
        assert_eq!(monitor.next_recovery_eligible_at("key-a"), Some(70.0));
    }

    #[test]
    fn test_further_failures_do_not_extend_quarantine() {
        let (monitor, clock) = monitor_with_clock();

        quarantine(&monitor, "key-a");
        clock.advance(Duration::from_secs(30));
        monitor.record_failure("key-a", None);
        monitor.record_failure("key-a", None);

        assert_eq!(monitor.recovery_attempts("key-a"), 1);
        assert_eq!(monitor.next_recovery_eligible_at("key-a"), Some(60.0));
    }

    #[test]
    fn test_success_does_not_leave_quarantine() {
        let (monitor, _) = monitor_with_clock();

        quarantine(&monitor, "key-a");
        for _ in 0..10 {
            monitor.record_success("key-a", 50.0);
        }

        assert_eq!(monitor.status("key-a"), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_recovery_scan_waits_for_backoff() {
        let (monitor, clock) = monitor_with_clock();

        quarantine(&monitor, "key-a");

        clock.advance(Duration::from_secs(59));
        assert!(monitor.run_recovery_scan().is_empty());
        assert_eq!(monitor.status("key-a"), HealthStatus::Unhealthy);

        clock.advance(Duration::from_secs(1));
        assert_eq!(monitor.run_recovery_scan(), vec!["key-a".to_string()]);
        assert_eq!(monitor.status("key-a"), HealthStatus::Recovering);
        assert!(monitor.is_recovering("key-a"));
        assert!(!monitor.is_healthy("key-a"));
    }

    #[test]
    fn test_probation_resets_success_streak() {
        let (monitor, clock) = monitor_with_clock();

        quarantine(&monitor, "key-a");
        for _ in 0..4 {
            monitor.record_success("key-a", 10.0);
        }
        clock.advance(Duration::from_secs(60));
        monitor.run_recovery_scan();

        assert_eq!(monitor.report("key-a").consecutive_successes, 0);

        // The four successes during quarantine do not count towards probation
        monitor.record_success("key-a", 10.0);
        assert_eq!(monitor.status("key-a"), HealthStatus::Recovering);
    }

    #[test]
    fn test_five_successes_complete_recovery() {
        let (monitor, clock) = monitor_with_clock();

        quarantine(&monitor, "key-a");
        clock.advance(Duration::from_secs(60));
        monitor.run_recovery_scan();

        for _ in 0..4 {
            assert_eq!(
                monitor.record_success("key-a", 20.0),
                HealthStatus::Recovering
            );
        }
        assert_eq!(monitor.record_success("key-a", 20.0), HealthStatus::Healthy);
        assert_eq!(monitor.recovery_attempts("key-a"), 0);
        assert_eq!(monitor.next_recovery_eligible_at("key-a"), None);
    }

    #[test]
    fn test_recovered_credential_does_not_requarantine_on_old_samples() {
        let (monitor, clock) = monitor_with_clock();

        for _ in 0..10 {
            monitor.record_failure("key-a", None);
        }
        clock.advance(Duration::from_secs(60));
        monitor.run_recovery_scan();
        for _ in 0..5 {
            monitor.record_success("key-a", 20.0);
        }

        assert_eq!(monitor.record_success("key-a", 20.0), HealthStatus::Healthy);
    }

    #[test]
    fn test_exponential_backoff_without_full_recovery() {
        let (monitor, clock) = monitor_with_clock();

        quarantine(&monitor, "key-a");
        assert_eq!(monitor.next_recovery_eligible_at("key-a"), Some(60.0));

        clock.set(60.0);
        monitor.run_recovery_scan();
        assert!(monitor.is_recovering("key-a"));

        // Failing probation re-quarantines with a doubled backoff
        quarantine(&monitor, "key-a");
        assert_eq!(monitor.status("key-a"), HealthStatus::Unhealthy);
        assert_eq!(monitor.recovery_attempts("key-a"), 2);
        assert_eq!(monitor.next_recovery_eligible_at("key-a"), Some(180.0));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = HealthConfig::default();

        assert_eq!(config.backoff_secs(0), 60.0);
        assert_eq!(config.backoff_secs(1), 120.0);
        assert_eq!(config.backoff_secs(2), 240.0);
        assert_eq!(config.backoff_secs(5), 1920.0);
        assert_eq!(config.backoff_secs(6), 3600.0);
        assert_eq!(config.backoff_secs(40), 3600.0);
    }

    #[test]
    fn test_backoff_cap_through_repeated_quarantines() {
        let (monitor, clock) = monitor_with_clock();

        let mut last_backoff = 0.0;
        for _ in 0..10 {
            let start = clock.now();
            quarantine(&monitor, "key-a");
            let eligible_at = monitor.next_recovery_eligible_at("key-a").unwrap();
            last_backoff = eligible_at - start;
            assert!(last_backoff <= 3600.0);

            clock.set(eligible_at);
            monitor.run_recovery_scan();
            assert!(monitor.is_recovering("key-a"));
        }

        assert_eq!(last_backoff, 3600.0);
    }

    #[test]
    fn test_jittered_backoff_within_bounds() {
        let config = HealthConfig {
            jitter_factor: 0.25,
            ..Default::default()
        };

        for _ in 0..50 {
            let backoff = config.backoff_secs(0);
            assert!(backoff >= 60.0 * 0.75 - 0.01, "backoff {} too short", backoff);
            assert!(backoff <= 60.0 + 0.01, "backoff {} too long", backoff);
        }
    }

    #[test]
    fn test_rate_drives_degraded_and_healthy() {
        let (monitor, _) = monitor_with_clock();

        // 6 successes / 4 failures, never three failures in a row
        for outcome in [true, false, true, false, true, false, true, true, false, true] {
            if outcome {
                monitor.record_success("key-b", 30.0);
            } else {
                monitor.record_failure("key-b", None);
            }
        }

        assert_eq!(monitor.status("key-b"), HealthStatus::Degraded);
        assert!(monitor.is_healthy("key-b"));
        assert_eq!(monitor.report("key-b").success_rate, Some(60.0));

        for _ in 0..10 {
            monitor.record_success("key-b", 30.0);
        }
        assert_eq!(monitor.status("key-b"), HealthStatus::Healthy);
    }

    #[test]
    fn test_low_rate_quarantines() {
        let (monitor, _) = monitor_with_clock();

        for outcome in [false, false, true, false, false, true] {
            if outcome {
                monitor.record_success("key-c", 30.0);
            } else {
                monitor.record_failure("key-c", None);
            }
        }

        assert_eq!(monitor.status("key-c"), HealthStatus::Unhealthy);
        assert_eq!(monitor.recovery_attempts("key-c"), 1);
        assert!(monitor.next_recovery_eligible_at("key-c").is_some());
    }

    #[test]
    fn test_rate_ignored_below_minimum_samples() {
        let (monitor, _) = monitor_with_clock();

        monitor.record_success("key-a", 10.0);
        monitor.record_failure("key-a", None);
        monitor.record_failure("key-a", None);

        // 33% success, but only three samples
        assert_eq!(monitor.status("key-a"), HealthStatus::Unknown);
    }

    #[test]
    fn test_recovering_ignores_rolling_rate() {
        let (monitor, clock) = monitor_with_clock();

        for _ in 0..20 {
            monitor.record_failure("key-a", None);
        }
        clock.advance(Duration::from_secs(60));
        monitor.run_recovery_scan();

        monitor.record_success("key-a", 10.0);
        monitor.record_failure("key-a", None);
        monitor.record_success("key-a", 10.0);

        assert_eq!(monitor.status("key-a"), HealthStatus::Recovering);
    }

    #[test]
    fn test_failures_are_isolated_per_credential() {
        let (monitor, _) = monitor_with_clock();

        quarantine(&monitor, "key-a");
        monitor.record_success("key-b", 10.0);

        assert_eq!(monitor.status("key-a"), HealthStatus::Unhealthy);
        assert!(monitor.is_healthy("key-b"));
    }

    #[test]
    fn test_report_contents() {
        let (monitor, clock) = monitor_with_clock();

        monitor.record_success("key-a", 100.0);
        clock.advance(Duration::from_secs(5));
        monitor.record_failure("key-a", Some("401 Unauthorized"));

        let report = monitor.report("key-a");
        assert_eq!(report.credential_id, "key-a");
        assert_eq!(report.samples, 2);
        assert_eq!(report.success_rate, Some(50.0));
        assert_eq!(report.consecutive_failures, 1);
        assert_eq!(report.last_success_at, Some(0.0));
        assert_eq!(report.last_failure_at, Some(5.0));
        assert_eq!(report.last_error.as_deref(), Some("401 Unauthorized"));

        let kinds: Vec<_> = report.recent_outcomes.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OutcomeKind::Success, OutcomeKind::Failure]);
        assert_eq!(report.recent_outcomes[0].latency_ms, 100.0);
        assert_eq!(report.recent_outcomes[1].timestamp, 5.0);
    }

    #[test]
    fn test_report_keeps_only_recent_outcomes() {
        let (monitor, clock) = monitor_with_clock();

        for _ in 0..(REPORT_RECENT_OUTCOMES + 5) {
            monitor.record_success("key-a", 10.0);
            clock.advance(Duration::from_secs(1));
        }

        let report = monitor.report("key-a");
        assert_eq!(report.recent_outcomes.len(), REPORT_RECENT_OUTCOMES);
        assert_eq!(report.recent_outcomes[0].timestamp, 5.0);
        assert_eq!(monitor.recent_outcomes("key-a", 3).len(), 3);
        assert!(monitor.recent_outcomes("nobody", 3).is_empty());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["recent_outcomes"][0]["kind"], "success");
    }

    #[test]
    fn test_success_racing_third_failure_cannot_cancel_quarantine() {
        let monitor_slot: Arc<OnceLock<Weak<HealthMonitor>>> = Arc::new(OnceLock::new());
        let racer: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        let slot = monitor_slot.clone();
        let racer_slot = racer.clone();
        let store = HookedStore::new().after_failure(move |inner, id| {
            if inner.consecutive_failures(id) != 3 {
                return;
            }
            let Some(monitor) = slot.get().and_then(Weak::upgrade) else {
                return;
            };
            let id = id.to_string();
            let handle = thread::spawn(move || {
                monitor.record_success(&id, 1.0);
            });
            // Give the success time to land between append and transition
            thread::sleep(Duration::from_millis(50));
            *racer_slot.lock() = Some(handle);
        });

        let monitor = Arc::new(
            HealthMonitor::new(HealthConfig::default(), Arc::new(ManualClock::new()))
                .with_store(Arc::new(store)),
        );
        monitor_slot.set(Arc::downgrade(&monitor)).unwrap();

        monitor.record_failure("key-a", Some("boom"));
        monitor.record_failure("key-a", Some("boom"));
        assert_eq!(
            monitor.record_failure("key-a", Some("boom")),
            HealthStatus::Unhealthy
        );

        racer.lock().take().unwrap().join().unwrap();

        assert_eq!(monitor.status("key-a"), HealthStatus::Unhealthy);
        let report = monitor.report("key-a");
        assert_eq!(report.samples, 4);
        assert_eq!(report.consecutive_successes, 1);
        assert_eq!(report.recovery_attempts, 1);
    }

    #[test]
    fn test_report_for_untracked_credential() {
        let (monitor, _) = monitor_with_clock();

        let report = monitor.report("nobody");
        assert_eq!(report.status, HealthStatus::Unknown);
        assert_eq!(report.samples, 0);
        assert_eq!(report.success_rate, None);
        assert_eq!(report.recovery_attempts, 0);
    }

    #[test]
    fn test_forget_drops_state() {
        let (monitor, _) = monitor_with_clock();

        quarantine(&monitor, "key-a");
        monitor.forget("key-a");

        assert_eq!(monitor.status("key-a"), HealthStatus::Unknown);
        assert_eq!(monitor.report("key-a").samples, 0);
        assert_eq!(monitor.tracked(), 0);
    }

    #[test]
    fn test_health_change_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let clock = Arc::new(ManualClock::new());
        let monitor = HealthMonitor::new(HealthConfig::default(), clock.clone())
            .with_event_sink(Arc::new(CallbackSink::new(move |event| {
                events_clone.lock().push(event.clone());
            })));

        quarantine(&monitor, "key-a");
        clock.advance(Duration::from_secs(60));
        monitor.run_recovery_scan();

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                PoolEvent::HealthChanged {
                    credential_id: "key-a".to_string(),
                    from: HealthStatus::Unknown,
                    to: HealthStatus::Unhealthy,
                },
                PoolEvent::HealthChanged {
                    credential_id: "key-a".to_string(),
                    from: HealthStatus::Unhealthy,
                    to: HealthStatus::Recovering,
                },
            ]
        );
    }

    #[test]
    fn test_state_machine_quarantine_guard() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let clock = Arc::new(ManualClock::new());
        let ctx = HealthContext {
            credential_id: "key-a".to_string(),
            config: HealthConfig::default(),
            store: store.clone(),
            clock: clock.clone(),
        };

        let mut machine = DynamicHealth::new(ctx);

        let result = machine.handle(HealthEvent::Quarantine);
        assert!(result.is_err(), "Should fail guard without failures");

        store.record_failure("key-a", 0.0, 0.0);
        store.record_failure("key-a", 0.0, 0.0);
        store.record_failure("key-a", 0.0, 0.0);

        machine
            .handle(HealthEvent::Quarantine)
            .expect("Should quarantine after three failures");
        assert_eq!(machine.current_state(), "Unhealthy");
    }

    #[test]
    fn test_state_machine_begin_recovery_guard() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let clock = Arc::new(ManualClock::new());
        let ctx = HealthContext {
            credential_id: "key-a".to_string(),
            config: HealthConfig::default(),
            store: store.clone(),
            clock: clock.clone(),
        };

        for _ in 0..3 {
            store.record_failure("key-a", 0.0, 0.0);
        }
        let mut machine = DynamicHealth::new(ctx);
        machine.handle(HealthEvent::Quarantine).expect("Should quarantine");

        if let Some(data) = machine.unhealthy_data_mut() {
            data.next_recovery_eligible_at = 30.0;
        }

        let result = machine.handle(HealthEvent::BeginRecovery);
        assert!(result.is_err(), "Should fail guard before backoff elapses");

        clock.set(30.0);
        machine
            .handle(HealthEvent::BeginRecovery)
            .expect("Should start probation");
        assert_eq!(machine.current_state(), "Recovering");

        let result = machine.handle(HealthEvent::Recover);
        assert!(result.is_err(), "Should fail guard without successes");
    }

    #[test]
    fn test_concurrent_outcomes_on_one_credential() {
        let (monitor, _) = monitor_with_clock();
        let monitor = Arc::new(monitor);
        let mut handles = vec![];

        for _ in 0..8 {
            let monitor = Arc::clone(&monitor);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    monitor.record_success("key-a", 5.0);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let report = monitor.report("key-a");
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.samples, 100);
        assert_eq!(report.consecutive_successes, 800);
    }
}
