//! The credential pool's public surface
//!
//! `PoolAllocator` composes the registry, the health monitor and the load
//! balancer, and layers the fixed-window cooldown on top of health tracking:
//! five pool-level errors lock a credential out for 300 seconds, independent of
//! its health quarantine.

use crate::{
    Clock,
    balancer::{Candidate, LoadBalancer},
    builder::PoolBuilder,
    config::{CredentialConfig, PoolConfig},
    errors::PoolError,
    events::{EventSink, PoolEvent},
    health::{HealthMonitor, HealthReport, HealthStatus},
    registry::{
        AdminState, Credential, CredentialEntry, CredentialRegistry, CredentialStatus, Release,
    },
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Aggregate view of the pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub full: usize,
    pub cooldown: usize,
    pub disabled: usize,
    pub total_capacity: usize,
    pub total_used: usize,
    /// Successful allocations since start
    pub allocation_count: u64,
    /// Sum of the credentials' current pool-level error counts
    pub error_count: u64,
    /// Allocations that found no eligible credential
    pub exhausted_count: u64,
}

/// Dashboard row for one credential
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialSummary {
    #[serde(flatten)]
    pub credential: Credential,
    pub health: HealthStatus,
}

/// Concurrent credential allocator
///
/// # Example
///
/// ```rust
/// use pool_machines::{CredentialConfig, PoolAllocator, PoolError};
///
/// let pool = PoolAllocator::builder()
///     .credential(CredentialConfig::new("primary").capacity(1))
///     .build()
///     .unwrap();
///
/// let credential = pool.allocate(None).unwrap();
/// assert_eq!(credential.id, "primary");
/// assert!(matches!(pool.allocate(None), Err(PoolError::Exhausted { .. })));
///
/// pool.release(&credential.id);
/// assert!(pool.allocate(None).is_ok());
/// ```
pub struct PoolAllocator {
    error_threshold: u32,
    cooldown_secs: f64,
    registry: Arc<CredentialRegistry>,
    health: Arc<HealthMonitor>,
    balancer: LoadBalancer,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn EventSink>>,
    allocation_count: AtomicU64,
    exhausted_count: AtomicU64,
}

impl PoolAllocator {
    /// Create a new builder
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Build an allocator from configuration and load its credentials
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        PoolBuilder::from_config(config).build()
    }

    pub(crate) fn from_parts(
        config: &PoolConfig,
        health: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            error_threshold: config.error_threshold.max(1),
            cooldown_secs: config.cooldown_secs,
            registry: Arc::new(CredentialRegistry::new()),
            health,
            balancer: LoadBalancer::new(),
            clock,
            sink,
            allocation_count: AtomicU64::new(0),
            exhausted_count: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<CredentialRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Load a batch of credential records
    ///
    /// The whole batch is validated first; on any error nothing is added.
    pub fn initialize(&self, records: &[CredentialConfig]) -> Result<usize, PoolError> {
        let mut seen = HashSet::new();
        for record in records {
            record.validate()?;
            if !seen.insert(record.id.as_str()) || self.registry.contains(&record.id) {
                return Err(PoolError::DuplicateCredential {
                    id: record.id.clone(),
                });
            }
        }

        for record in records {
            self.add_credential(record.clone())?;
        }

        info!(credentials = records.len(), "credential pool initialized");
        Ok(records.len())
    }

    /// Hand out the best available credential
    ///
    /// `hint` names a preferred credential (for example the one a session used
    /// last); it is honored when that credential is selectable and usable.
    pub fn allocate(&self, hint: Option<&str>) -> Result<Credential, PoolError> {
        // A concurrent caller can take the last slot between selection and
        // acquisition; retry with a fresh eligible list.
        let attempts = self.registry.len() + 1;

        for _ in 0..attempts {
            let now = self.clock.now();
            let candidates: Vec<Candidate> = self
                .registry
                .list_eligible(now)
                .iter()
                .map(|entry| Candidate {
                    credential_id: entry.id().to_string(),
                    priority: entry.priority(),
                    load: entry.current_load(),
                    capacity: entry.capacity(),
                    base_weight: entry.base_weight(),
                    health: self.health.status(entry.id()),
                })
                .collect();

            if candidates.is_empty() {
                break;
            }

            let usable: Vec<Candidate> = candidates
                .iter()
                .filter(|c| c.health.is_usable())
                .cloned()
                .collect();

            let chosen = self
                .balancer
                .select_preferred(&usable, hint)
                .or_else(|| self.balancer.select_preferred(&candidates, hint));

            let Some(chosen) = chosen else {
                break;
            };

            if let Some(credential) = self.registry.try_acquire(&chosen.credential_id, now) {
                self.allocation_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    credential = %credential.id,
                    load = credential.current_load,
                    capacity = credential.capacity,
                    health = %chosen.health,
                    "credential allocated"
                );
                self.emit(PoolEvent::Allocated {
                    credential_id: credential.id.clone(),
                    load: credential.current_load,
                    capacity: credential.capacity,
                });
                return Ok(credential);
            }

            debug!(credential = %chosen.credential_id, "lost allocation race, retrying");
        }

        Err(self.exhausted(hint))
    }

    fn exhausted(&self, hint: Option<&str>) -> PoolError {
        let registered = self.registry.len();
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
        warn!(registered, hint = hint.unwrap_or(""), "credential pool exhausted");
        self.emit(PoolEvent::Exhausted {
            registered,
            hint: hint.map(str::to_string),
        });
        PoolError::Exhausted { registered }
    }

    /// Give back a credential; returns false if nothing was released
    pub fn release(&self, credential_id: &str) -> bool {
        match self.registry.release(credential_id) {
            Release::Released {
                load,
                capacity,
                was_full,
            } => {
                debug!(credential = %credential_id, load, capacity, was_full, "credential released");
                self.emit(PoolEvent::Released {
                    credential_id: credential_id.to_string(),
                    load,
                    capacity,
                });
                true
            }
            Release::Retired { .. } | Release::Clamped | Release::Unknown => false,
        }
    }

    /// Report a failed upstream call made with a credential
    pub fn report_error(&self, credential_id: &str, message: &str) {
        let Some(entry) = self.registry.get(credential_id) else {
            debug!(credential = %credential_id, "error for unregistered credential ignored");
            return;
        };

        let now = self.clock.now();
        let cooldown = {
            let mut state = entry.state_at(now);
            state.error_count = state.error_count.saturating_add(1);

            if state.error_count >= self.error_threshold && state.admin != AdminState::Disabled {
                let until = now + self.cooldown_secs;
                state.admin = AdminState::Cooldown;
                state.cooldown_until = Some(until);
                Some((state.error_count, until))
            } else {
                None
            }
        };

        let message = (!message.is_empty()).then_some(message);
        self.health.record_failure(credential_id, message);

        if let Some((error_count, until)) = cooldown {
            warn!(
                credential = %credential_id,
                error_count,
                cooldown_secs = self.cooldown_secs,
                "credential placed in cooldown"
            );
            self.emit(PoolEvent::Cooldown {
                credential_id: credential_id.to_string(),
                error_count,
                until,
            });
        }
    }

    /// Report a successful upstream call made with a credential
    pub fn report_success(&self, credential_id: &str, latency_ms: Option<f64>) {
        let Some(entry) = self.registry.get(credential_id) else {
            debug!(credential = %credential_id, "success for unregistered credential ignored");
            return;
        };

        {
            let mut state = entry.state_at(self.clock.now());
            state.error_count = state.error_count.saturating_sub(1);
            if state.admin == AdminState::Cooldown {
                state.admin = AdminState::Active;
                state.cooldown_until = None;
                info!(credential = %credential_id, "cooldown lifted by success");
            }
        }

        self.health
            .record_success(credential_id, latency_ms.unwrap_or(0.0));
    }

    /// Register a credential and return its id
    pub fn add_credential(&self, config: CredentialConfig) -> Result<String, PoolError> {
        let entry = self.registry.add(&config)?;

        info!(
            credential = %entry.id(),
            capacity = entry.capacity(),
            priority = entry.priority(),
            "credential added"
        );
        self.emit(PoolEvent::Added {
            credential_id: config.id.clone(),
            capacity: entry.capacity(),
            priority: entry.priority(),
        });
        Ok(config.id)
    }

    /// Remove a credential; outstanding holders are not waited for
    pub fn remove_credential(&self, credential_id: &str) -> bool {
        let Some(entry) = self.registry.remove(credential_id) else {
            return false;
        };

        self.health.forget(credential_id);
        let outstanding = entry.current_load();

        info!(credential = %credential_id, outstanding, "credential removed");
        self.emit(PoolEvent::Removed {
            credential_id: credential_id.to_string(),
            outstanding,
        });
        true
    }

    /// Take a credential out of rotation until re-enabled
    pub fn disable_credential(&self, credential_id: &str) -> Result<CredentialStatus, PoolError> {
        let entry = self.entry(credential_id)?;
        let now = self.clock.now();

        entry.state_at(now).admin = AdminState::Disabled;
        info!(credential = %credential_id, "credential disabled");
        Ok(entry.status(now))
    }

    /// Return a credential to rotation, clearing cooldown and error count
    pub fn enable_credential(&self, credential_id: &str) -> Result<CredentialStatus, PoolError> {
        let entry = self.entry(credential_id)?;
        let now = self.clock.now();

        {
            let mut state = entry.state_at(now);
            state.admin = AdminState::Active;
            state.cooldown_until = None;
            state.error_count = 0;
        }
        info!(credential = %credential_id, "credential enabled");
        Ok(entry.status(now))
    }

    fn entry(&self, credential_id: &str) -> Result<Arc<CredentialEntry>, PoolError> {
        self.registry
            .get(credential_id)
            .ok_or_else(|| PoolError::UnknownCredential {
                id: credential_id.to_string(),
            })
    }

    /// Snapshot of one credential
    pub fn credential(&self, credential_id: &str) -> Option<Credential> {
        self.registry
            .get(credential_id)
            .map(|entry| entry.snapshot(self.clock.now()))
    }

    pub fn get_stats(&self) -> PoolStats {
        let now = self.clock.now();
        let mut stats = PoolStats {
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            ..Default::default()
        };

        for entry in self.registry.all() {
            let credential = entry.snapshot(now);
            stats.total += 1;
            stats.total_capacity += credential.capacity;
            stats.total_used += credential.current_load;
            stats.error_count += u64::from(credential.error_count);
            match credential.status {
                CredentialStatus::Active => stats.available += 1,
                CredentialStatus::Full => stats.full += 1,
                CredentialStatus::Cooldown => stats.cooldown += 1,
                CredentialStatus::Disabled => stats.disabled += 1,
            }
        }

        stats
    }

    /// Health view of a registered credential
    pub fn get_credential_health(&self, credential_id: &str) -> Option<HealthReport> {
        self.registry
            .contains(credential_id)
            .then(|| self.health.report(credential_id))
    }

    /// Every credential with its health, in id order
    pub fn list_all(&self) -> Vec<CredentialSummary> {
        let now = self.clock.now();
        self.registry
            .all()
            .iter()
            .map(|entry| CredentialSummary {
                credential: entry.snapshot(now),
                health: self.health.status(entry.id()),
            })
            .collect()
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(sink) = &self.sink {
            sink.on_event(&event);
        }
    }
}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("error_threshold", &self.error_threshold)
            .field("cooldown_secs", &self.cooldown_secs)
            .field("registry", &self.registry)
            .field("health", &self.health)
            .field("allocation_count", &self.allocation_count)
            .field("exhausted_count", &self.exhausted_count)
            .finish()
    }
}
