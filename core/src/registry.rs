//! Credential catalog and capacity accounting
//!
//! The registry owns every credential's load gauge and pool-level state. It
//! is the source of truth for capacity; the allocator decides policy on top.

use crate::{config::CredentialConfig, errors::PoolError, load::LoadGauge};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pool-level status of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    /// Every slot is held
    Full,
    /// Administratively taken out of rotation
    Disabled,
    /// Locked out after repeated errors
    Cooldown,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Full => "full",
            CredentialStatus::Disabled => "disabled",
            CredentialStatus::Cooldown => "cooldown",
        }
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status stored for a credential; `Full` is derived from the load gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdminState {
    Active,
    Disabled,
    Cooldown,
}

/// Mutable pool-level state guarded by the credential's own lock
#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) admin: AdminState,
    pub(crate) error_count: u32,
    pub(crate) cooldown_until: Option<f64>,
}

impl PoolState {
    /// Lift an elapsed cooldown. The error count is kept.
    fn refresh(&mut self, credential_id: &str, now: f64) {
        if self.admin == AdminState::Cooldown
            && self.cooldown_until.is_none_or(|until| until <= now)
        {
            self.admin = AdminState::Active;
            self.cooldown_until = None;
            debug!(credential = %credential_id, "cooldown elapsed");
        }
    }
}

/// Snapshot of a credential
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Credential {
    pub id: String,
    pub label: Option<String>,
    pub capacity: usize,
    pub current_load: usize,
    pub priority: i32,
    pub base_weight: f64,
    pub status: CredentialStatus,
    pub error_count: u32,
    pub cooldown_until: Option<f64>,
}

impl Credential {
    /// Fraction of capacity in use
    pub fn usage_ratio(&self) -> f64 {
        self.current_load as f64 / self.capacity.max(1) as f64
    }
}

/// A registered credential
#[derive(Debug)]
pub struct CredentialEntry {
    id: String,
    label: Option<String>,
    priority: i32,
    base_weight: f64,
    load: LoadGauge,
    state: Mutex<PoolState>,
}

impl CredentialEntry {
    fn new(config: &CredentialConfig) -> Self {
        Self {
            id: config.id.clone(),
            label: config.label.clone(),
            priority: config.priority,
            base_weight: config.base_weight,
            load: LoadGauge::new(config.capacity),
            state: Mutex::new(PoolState {
                admin: AdminState::Active,
                error_count: 0,
                cooldown_until: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn base_weight(&self) -> f64 {
        self.base_weight
    }

    pub fn capacity(&self) -> usize {
        self.load.capacity()
    }

    pub fn current_load(&self) -> usize {
        self.load.current()
    }

    pub fn load(&self) -> &LoadGauge {
        &self.load
    }

    /// Lock the pool-level state after lifting an elapsed cooldown
    pub(crate) fn state_at(&self, now: f64) -> MutexGuard<'_, PoolState> {
        let mut state = self.state.lock();
        state.refresh(&self.id, now);
        state
    }

    fn status_of(&self, state: &PoolState) -> CredentialStatus {
        match state.admin {
            AdminState::Disabled => CredentialStatus::Disabled,
            AdminState::Cooldown => CredentialStatus::Cooldown,
            AdminState::Active if self.load.is_full() => CredentialStatus::Full,
            AdminState::Active => CredentialStatus::Active,
        }
    }

    pub fn status(&self, now: f64) -> CredentialStatus {
        let state = self.state_at(now);
        self.status_of(&state)
    }

    /// Eligible for a new holder right now
    pub fn is_eligible(&self, now: f64) -> bool {
        self.status(now) == CredentialStatus::Active
    }

    pub fn snapshot(&self, now: f64) -> Credential {
        let state = self.state_at(now);
        Credential {
            id: self.id.clone(),
            label: self.label.clone(),
            capacity: self.load.capacity(),
            current_load: self.load.current(),
            priority: self.priority,
            base_weight: self.base_weight,
            status: self.status_of(&state),
            error_count: state.error_count,
            cooldown_until: state.cooldown_until,
        }
    }
}

/// Outcome of giving a slot back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// A slot was freed
    Released {
        load: usize,
        capacity: usize,
        was_full: bool,
    },
    /// Load was already zero; nothing changed
    Clamped,
    /// Counted against a removed credential that still had holders
    Retired { outstanding: usize },
    /// The credential is not registered (possibly removed meanwhile)
    Unknown,
}

/// In-memory catalog of credentials, ordered by id
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    entries: RwLock<BTreeMap<String, Arc<CredentialEntry>>>,
    /// Holders still outstanding on removed credentials, by id
    retired: Mutex<HashMap<String, usize>>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential
    ///
    /// Invalid capacity and duplicate ids are rejected without touching the
    /// catalog.
    pub fn add(&self, config: &CredentialConfig) -> Result<Arc<CredentialEntry>, PoolError> {
        config.validate()?;

        let mut entries = self.entries.write();
        if entries.contains_key(&config.id) {
            return Err(PoolError::DuplicateCredential {
                id: config.id.clone(),
            });
        }

        let entry = Arc::new(CredentialEntry::new(config));
        entries.insert(config.id.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Remove a credential; unknown ids are a no-op
    ///
    /// Outstanding holders are not waited for. Their later releases are
    /// absorbed by a retired count and never reach a credential re-added under
    /// the same id.
    pub fn remove(&self, credential_id: &str) -> Option<Arc<CredentialEntry>> {
        let mut entries = self.entries.write();
        let entry = entries.remove(credential_id)?;

        let outstanding = entry.current_load();
        if outstanding > 0 {
            *self
                .retired
                .lock()
                .entry(credential_id.to_string())
                .or_insert(0) += outstanding;
        }
        Some(entry)
    }

    /// Holders of removed credentials under this id that have not released yet
    pub fn retired_holders(&self, credential_id: &str) -> usize {
        self.retired.lock().get(credential_id).copied().unwrap_or(0)
    }

    pub fn get(&self, credential_id: &str) -> Option<Arc<CredentialEntry>> {
        self.entries.read().get(credential_id).cloned()
    }

    pub fn contains(&self, credential_id: &str) -> bool {
        self.entries.read().contains_key(credential_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All credentials in id order
    pub fn all(&self) -> Vec<Arc<CredentialEntry>> {
        self.entries.read().values().cloned().collect()
    }

    /// Credentials that can take another holder now, in id order
    pub fn list_eligible(&self, now: f64) -> Vec<Arc<CredentialEntry>> {
        self.all()
            .into_iter()
            .filter(|entry| entry.is_eligible(now))
            .collect()
    }

    /// Take a slot on a credential if it is still eligible
    ///
    /// Returns the snapshot after the increment, or `None` if the credential
    /// is gone, not active, or filled up concurrently.
    pub fn try_acquire(&self, credential_id: &str, now: f64) -> Option<Credential> {
        // Held across the increment so `remove` sees every holder it retires
        let entries = self.entries.read();
        let entry = entries.get(credential_id)?;

        {
            let state = entry.state_at(now);
            if state.admin != AdminState::Active {
                return None;
            }
            entry.load.try_acquire()?;
        }

        Some(entry.snapshot(now))
    }

    /// Give a slot back; releasing an idle credential is clamped
    pub fn release(&self, credential_id: &str) -> Release {
        let entries = self.entries.read();

        {
            let mut retired = self.retired.lock();
            if let Some(outstanding) = retired.get_mut(credential_id) {
                *outstanding -= 1;
                let outstanding = *outstanding;
                if outstanding == 0 {
                    retired.remove(credential_id);
                }
                debug!(credential = %credential_id, outstanding, "release for removed credential absorbed");
                return Release::Retired { outstanding };
            }
        }

        let Some(entry) = entries.get(credential_id) else {
            debug!(credential = %credential_id, "release for unregistered credential ignored");
            return Release::Unknown;
        };

        let capacity = entry.capacity();
        match entry.load.release() {
            Some(load) => Release::Released {
                load,
                capacity,
                was_full: load + 1 == capacity,
            },
            None => {
                warn!(credential = %credential_id, "release without holder, load clamped at 0");
                Release::Clamped
            }
        }
    }
}
