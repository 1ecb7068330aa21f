//! Error types for credential pool operations

use thiserror::Error;

/// Errors surfaced by the credential pool
///
/// Only [`PoolError::Exhausted`] is a control-flow condition on the allocation
/// path; the remaining variants reject administrative calls without touching
/// registry state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// No credential is currently eligible for allocation
    #[error("credential pool exhausted ({registered} registered, none eligible)")]
    Exhausted { registered: usize },

    /// Capacity must allow at least one concurrent holder
    #[error("credential '{id}' has invalid capacity {capacity} (must be greater than 0)")]
    InvalidCapacity { id: String, capacity: usize },

    /// A credential with this id is already registered
    #[error("credential '{id}' is already registered")]
    DuplicateCredential { id: String },

    /// No credential with this id is registered
    #[error("credential '{id}' is not registered")]
    UnknownCredential { id: String },

    /// Pool configuration could not be parsed
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Background work was started outside a tokio runtime
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
}

impl PoolError {
    /// Whether callers should back off and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(err: toml::de::Error) -> Self {
        PoolError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_is_retryable() {
        let err = PoolError::Exhausted { registered: 2 };
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "credential pool exhausted (2 registered, none eligible)"
        );
    }

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        let err = PoolError::InvalidCapacity {
            id: "key-a".to_string(),
            capacity: 0,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("key-a"));

        let err = PoolError::DuplicateCredential {
            id: "key-a".to_string(),
        };
        assert!(!err.is_retryable());
    }
}
