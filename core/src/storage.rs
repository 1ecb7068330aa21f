//! Outcome storage for credential health tracking
//!
//! `MemoryOutcomeStore` keeps, per credential, a fixed-capacity ring buffer of
//! the most recent outcomes together with the success/failure streaks the
//! health state machine guards read from.

use crate::{Outcome, OutcomeKind};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Default number of outcomes kept per credential
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Abstract storage backend for credential outcomes
pub trait OutcomeStore: Send + Sync + std::fmt::Debug {
    /// Record a successful use of a credential
    fn record_success(&self, credential_id: &str, latency_ms: f64, timestamp: f64);

    /// Record a failed use of a credential
    fn record_failure(&self, credential_id: &str, latency_ms: f64, timestamp: f64);

    /// Success rate over the window as a percentage, `None` without samples
    fn success_rate(&self, credential_id: &str) -> Option<f64>;

    /// Number of samples currently in the window
    fn sample_count(&self, credential_id: &str) -> usize;

    /// Successes recorded since the last failure
    fn consecutive_successes(&self, credential_id: &str) -> u32;

    /// Failures recorded since the last success
    fn consecutive_failures(&self, credential_id: &str) -> u32;

    /// Restart the success streak (used when probation begins)
    fn reset_success_streak(&self, credential_id: &str);

    /// Drop the window samples but keep streaks and timestamps
    fn clear_samples(&self, credential_id: &str);

    /// Forget everything about a credential
    fn clear(&self, credential_id: &str);

    /// Aggregated view of a credential's window
    fn stats(&self, credential_id: &str) -> Option<WindowStats>;

    /// Most recent outcomes, oldest first (limited to last N)
    fn event_log(&self, credential_id: &str, limit: usize) -> Vec<Outcome>;
}

/// Aggregated window statistics for one credential
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: usize,
    pub successes: usize,
    pub success_rate: Option<f64>,
    pub average_latency_ms: Option<f64>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_success_at: Option<f64>,
    pub last_failure_at: Option<f64>,
}

/// Ring buffer of outcomes plus streak counters
#[derive(Debug)]
struct OutcomeWindow {
    samples: VecDeque<Outcome>,
    capacity: usize,
    successes: usize,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_success_at: Option<f64>,
    last_failure_at: Option<f64>,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            successes: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
        }
    }

    fn push(&mut self, outcome: Outcome) {
        if self.samples.len() == self.capacity
            && let Some(evicted) = self.samples.pop_front()
            && evicted.kind == OutcomeKind::Success
        {
            self.successes -= 1;
        }

        match outcome.kind {
            OutcomeKind::Success => {
                self.successes += 1;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                self.last_success_at = Some(outcome.timestamp);
            }
            OutcomeKind::Failure => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                self.last_failure_at = Some(outcome.timestamp);
            }
        }

        self.samples.push_back(outcome);
    }

    fn success_rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.successes as f64 * 100.0 / self.samples.len() as f64)
        }
    }

    fn clear_samples(&mut self) {
        self.samples.clear();
        self.successes = 0;
    }

    fn stats(&self) -> WindowStats {
        let average_latency_ms = if self.samples.is_empty() {
            None
        } else {
            let total: f64 = self.samples.iter().map(|s| s.latency_ms).sum();
            Some(total / self.samples.len() as f64)
        };

        WindowStats {
            samples: self.samples.len(),
            successes: self.successes,
            success_rate: self.success_rate(),
            average_latency_ms,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
        }
    }
}

/// Thread-safe in-memory outcome storage
///
/// The map lock is only taken for writing when a credential is seen for the
/// first time; appends lock the credential's own window.
#[derive(Debug)]
pub struct MemoryOutcomeStore {
    windows: RwLock<HashMap<String, Arc<Mutex<OutcomeWindow>>>>,
    window_size: usize,
}

impl MemoryOutcomeStore {
    /// Create a store keeping the default 100 outcomes per credential
    pub fn new() -> Self {
        Self::with_window_size(DEFAULT_WINDOW_SIZE)
    }

    /// Create a store with a custom window size (at least 1)
    pub fn with_window_size(window_size: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window_size: window_size.max(1),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    fn window(&self, credential_id: &str) -> Arc<Mutex<OutcomeWindow>> {
        if let Some(window) = self.windows.read().get(credential_id) {
            return Arc::clone(window);
        }

        let mut windows = self.windows.write();
        Arc::clone(
            windows
                .entry(credential_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(OutcomeWindow::new(self.window_size)))),
        )
    }

    fn existing(&self, credential_id: &str) -> Option<Arc<Mutex<OutcomeWindow>>> {
        self.windows.read().get(credential_id).cloned()
    }

    fn record_outcome(&self, credential_id: &str, kind: OutcomeKind, latency_ms: f64, timestamp: f64) {
        let window = self.window(credential_id);
        window.lock().push(Outcome {
            kind,
            timestamp,
            latency_ms,
        });
    }
}

impl Default for MemoryOutcomeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeStore for MemoryOutcomeStore {
    fn record_success(&self, credential_id: &str, latency_ms: f64, timestamp: f64) {
        self.record_outcome(credential_id, OutcomeKind::Success, latency_ms, timestamp);
    }

    fn record_failure(&self, credential_id: &str, latency_ms: f64, timestamp: f64) {
        self.record_outcome(credential_id, OutcomeKind::Failure, latency_ms, timestamp);
    }

    fn success_rate(&self, credential_id: &str) -> Option<f64> {
        self.existing(credential_id)
            .and_then(|w| w.lock().success_rate())
    }

    fn sample_count(&self, credential_id: &str) -> usize {
        self.existing(credential_id)
            .map(|w| w.lock().samples.len())
            .unwrap_or(0)
    }

    fn consecutive_successes(&self, credential_id: &str) -> u32 {
        self.existing(credential_id)
            .map(|w| w.lock().consecutive_successes)
            .unwrap_or(0)
    }

    fn consecutive_failures(&self, credential_id: &str) -> u32 {
        self.existing(credential_id)
            .map(|w| w.lock().consecutive_failures)
            .unwrap_or(0)
    }

    fn reset_success_streak(&self, credential_id: &str) {
        if let Some(window) = self.existing(credential_id) {
            window.lock().consecutive_successes = 0;
        }
    }

    fn clear_samples(&self, credential_id: &str) {
        if let Some(window) = self.existing(credential_id) {
            window.lock().clear_samples();
        }
    }

    fn clear(&self, credential_id: &str) {
        self.windows.write().remove(credential_id);
    }

    fn stats(&self, credential_id: &str) -> Option<WindowStats> {
        self.existing(credential_id).map(|w| w.lock().stats())
    }

    fn event_log(&self, credential_id: &str, limit: usize) -> Vec<Outcome> {
        self.existing(credential_id)
            .map(|w| {
                let window = w.lock();
                let skip = window.samples.len().saturating_sub(limit);
                window.samples.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}
