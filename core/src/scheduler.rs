//! Background recovery scan
//!
//! Quarantined credentials only move on to probation through this task. It
//! runs `HealthMonitor::run_recovery_scan` on a fixed interval until its
//! cancellation token fires.

use crate::health::HealthMonitor;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct RecoveryScheduler {
    monitor: Arc<HealthMonitor>,
    interval: Duration,
}

impl RecoveryScheduler {
    /// Scheduler using the monitor's configured scan interval
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        let interval = Duration::try_from_secs_f64(monitor.config().recovery_interval_secs)
            .unwrap_or(MIN_INTERVAL);
        Self::with_interval(monitor, interval)
    }

    pub fn with_interval(monitor: Arc<HealthMonitor>, interval: Duration) -> Self {
        Self {
            monitor,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one scan, containing any panic raised inside it
    pub fn tick(&self) -> Vec<String> {
        match catch_unwind(AssertUnwindSafe(|| self.monitor.run_recovery_scan())) {
            Ok(recovering) => recovering,
            Err(_) => {
                error!("recovery scan panicked, retrying on next tick");
                Vec::new()
            }
        }
    }

    /// Spawn the scan loop on the current tokio runtime
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Scan every interval until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(interval_ms = self.interval.as_millis() as u64, "recovery scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let recovering = self.tick();
                    if !recovering.is_empty() {
                        debug!(count = recovering.len(), "credentials entered probation");
                    }
                }
            }
        }

        info!("recovery scheduler stopped");
    }
}
