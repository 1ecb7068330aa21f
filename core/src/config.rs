//! Pool configuration
//!
//! Configuration normally arrives from an external store at startup. Every
//! field has a default, so a TOML document only needs the credential list:
//!
//! ```toml
//! error_threshold = 5
//! cooldown_secs = 300.0
//!
//! [health]
//! failure_threshold = 3
//!
//! [[credentials]]
//! id = "primary"
//! capacity = 15
//! priority = 80
//! ```

use crate::{HealthConfig, errors::PoolError};
use serde::{Deserialize, Serialize};

/// Default concurrent holders per credential
pub const DEFAULT_CAPACITY: usize = 15;

/// Default selection priority (higher is preferred)
pub const DEFAULT_PRIORITY: i32 = 50;

/// One credential as supplied by configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub id: String,

    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_base_weight")]
    pub base_weight: f64,

    /// Human readable name for dashboards
    #[serde(default)]
    pub label: Option<String>,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_base_weight() -> f64 {
    1.0
}

impl CredentialConfig {
    /// Credential with default capacity, priority and weight
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capacity: DEFAULT_CAPACITY,
            priority: DEFAULT_PRIORITY,
            base_weight: 1.0,
            label: None,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn base_weight(mut self, weight: f64) -> Self {
        self.base_weight = weight;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Reject records that can never be allocated sensibly
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.id.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "credential id must not be empty".to_string(),
            ));
        }

        if self.capacity == 0 {
            return Err(PoolError::InvalidCapacity {
                id: self.id.clone(),
                capacity: self.capacity,
            });
        }

        if !self.base_weight.is_finite() || self.base_weight < 0.0 {
            return Err(PoolError::InvalidConfig(format!(
                "credential '{}' has invalid base weight {}",
                self.id, self.base_weight
            )));
        }

        Ok(())
    }
}

/// Allocator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool-level errors that put a credential into cooldown
    pub error_threshold: u32,

    /// Fixed cooldown length in seconds
    pub cooldown_secs: f64,

    /// Health tracking and quarantine settings
    pub health: HealthConfig,

    /// Credentials loaded at startup
    pub credentials: Vec<CredentialConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            cooldown_secs: 300.0,
            health: HealthConfig::default(),
            credentials: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Parse a configuration document
    pub fn from_toml_str(input: &str) -> Result<Self, PoolError> {
        let config: PoolConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every credential record and reject duplicate ids
    pub fn validate(&self) -> Result<(), PoolError> {
        let mut seen = std::collections::HashSet::new();
        for credential in &self.credentials {
            credential.validate()?;
            if !seen.insert(credential.id.as_str()) {
                return Err(PoolError::DuplicateCredential {
                    id: credential.id.clone(),
                });
            }
        }
        Ok(())
    }
}
