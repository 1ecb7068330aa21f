//! PoolMachines - Credential pool broker with health-based quarantine
//!
//! This crate hands out a small set of shared, rate-limited credentials to many
//! concurrent consumers:
//! - Capacity accounting with lock-free load gauges (never over-allocates)
//! - State machine for credential health (Unknown → Healthy ⇄ Degraded → Unhealthy → Recovering)
//! - Exponential quarantine backoff with a background recovery scan
//! - Fixed-window cooldown after repeated pool-level errors
//! - Monotonic time tracking with an injectable clock
//!
//! # Example
//!
//! ```rust
//! use pool_machines::{CredentialConfig, HealthStatus, PoolAllocator};
//!
//! let pool = PoolAllocator::builder()
//!     .credential(CredentialConfig::new("primary").priority(80))
//!     .credential(CredentialConfig::new("backup").capacity(5))
//!     .on_event(|event| println!("{}: {:?}", event.kind(), event.payload()))
//!     .build()
//!     .unwrap();
//!
//! let credential = pool.allocate(None).unwrap();
//! assert_eq!(credential.id, "primary");
//!
//! // Report how the upstream call went, then give the slot back
//! pool.report_error(&credential.id, "429 Too Many Requests");
//! pool.release(&credential.id);
//!
//! assert_eq!(pool.health().status("primary"), HealthStatus::Unknown);
//! ```

pub mod allocator;
pub mod balancer;
pub mod builder;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod health;
pub mod load;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod storage;

pub use allocator::{CredentialSummary, PoolAllocator, PoolStats};
pub use balancer::{Candidate, LoadBalancer, health_factor};
pub use builder::PoolBuilder;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{CredentialConfig, DEFAULT_CAPACITY, DEFAULT_PRIORITY, PoolConfig};
pub use errors::PoolError;
pub use events::{CallbackSink, ChannelSink, EventSink, PoolEvent};
pub use health::{HealthConfig, HealthMonitor, HealthReport, HealthStatus};
pub use load::LoadGauge;
pub use registry::{Credential, CredentialRegistry, CredentialStatus, Release};
pub use scheduler::RecoveryScheduler;
pub use service::CredentialBroker;
pub use storage::{MemoryOutcomeStore, OutcomeStore, WindowStats};

use serde::Serialize;

/// Outcome kind for a credential use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// A single outcome recorded for a credential
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub timestamp: f64,
    pub latency_ms: f64,
}
