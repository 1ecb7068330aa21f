//! Pool events and the sinks that receive them
//!
//! Events are emitted synchronously from the allocation path, so sinks must
//! return quickly. `ChannelSink` hands events to a bounded channel and drops
//! them when the consumer falls behind instead of stalling allocations.

use crate::HealthStatus;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Something that happened inside the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    /// An allocation found no eligible credential
    Exhausted {
        registered: usize,
        hint: Option<String>,
    },
    Allocated {
        credential_id: String,
        load: usize,
        capacity: usize,
    },
    Released {
        credential_id: String,
        load: usize,
        capacity: usize,
    },
    /// Pool-level error threshold reached
    Cooldown {
        credential_id: String,
        error_count: u32,
        until: f64,
    },
    Added {
        credential_id: String,
        capacity: usize,
        priority: i32,
    },
    Removed {
        credential_id: String,
        outstanding: usize,
    },
    HealthChanged {
        credential_id: String,
        from: HealthStatus,
        to: HealthStatus,
    },
}

impl PoolEvent {
    /// Event type name used by dashboards and alerting
    pub fn kind(&self) -> &'static str {
        match self {
            PoolEvent::Exhausted { .. } => "pool.exhausted",
            PoolEvent::Allocated { .. } => "credential.allocated",
            PoolEvent::Released { .. } => "credential.released",
            PoolEvent::Cooldown { .. } => "credential.cooldown",
            PoolEvent::Added { .. } => "credential.added",
            PoolEvent::Removed { .. } => "credential.removed",
            PoolEvent::HealthChanged { .. } => "credential.healthChanged",
        }
    }

    /// Credential the event concerns, if any
    pub fn credential_id(&self) -> Option<&str> {
        match self {
            PoolEvent::Exhausted { .. } => None,
            PoolEvent::Allocated { credential_id, .. }
            | PoolEvent::Released { credential_id, .. }
            | PoolEvent::Cooldown { credential_id, .. }
            | PoolEvent::Added { credential_id, .. }
            | PoolEvent::Removed { credential_id, .. }
            | PoolEvent::HealthChanged { credential_id, .. } => Some(credential_id),
        }
    }

    /// Event fields as a JSON object
    pub fn payload(&self) -> Map<String, Value> {
        let value = match self {
            PoolEvent::Exhausted { registered, hint } => json!({
                "registered": registered,
                "hint": hint,
            }),
            PoolEvent::Allocated {
                credential_id,
                load,
                capacity,
            }
            | PoolEvent::Released {
                credential_id,
                load,
                capacity,
            } => json!({
                "credentialId": credential_id,
                "load": load,
                "capacity": capacity,
            }),
            PoolEvent::Cooldown {
                credential_id,
                error_count,
                until,
            } => json!({
                "credentialId": credential_id,
                "errorCount": error_count,
                "until": until,
            }),
            PoolEvent::Added {
                credential_id,
                capacity,
                priority,
            } => json!({
                "credentialId": credential_id,
                "capacity": capacity,
                "priority": priority,
            }),
            PoolEvent::Removed {
                credential_id,
                outstanding,
            } => json!({
                "credentialId": credential_id,
                "outstanding": outstanding,
            }),
            PoolEvent::HealthChanged {
                credential_id,
                from,
                to,
            } => json!({
                "credentialId": credential_id,
                "from": from,
                "to": to,
            }),
        };

        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Observer for pool events
pub trait EventSink: Send + Sync {
    /// Called synchronously; implementations must not block
    fn on_event(&self, event: &PoolEvent);
}

/// Sink that forwards events to a closure
#[derive(Clone)]
pub struct CallbackSink {
    callback: Arc<dyn Fn(&PoolEvent) + Send + Sync>,
}

impl CallbackSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(f),
        }
    }
}

impl EventSink for CallbackSink {
    fn on_event(&self, event: &PoolEvent) {
        (self.callback)(event);
    }
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink")
            .field("callback", &"<closure>")
            .finish()
    }
}

/// Sink that buffers events in a bounded channel
///
/// # Example
///
/// ```rust
/// use pool_machines::{ChannelSink, EventSink, PoolEvent};
///
/// let (sink, mut rx) = ChannelSink::new(16);
/// sink.on_event(&PoolEvent::Exhausted { registered: 0, hint: None });
///
/// let event = rx.try_recv().unwrap();
/// assert_eq!(event.kind(), "pool.exhausted");
/// ```
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PoolEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events are delivered to
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PoolEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: &PoolEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(event = dropped.kind(), "event buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                debug!(event = dropped.kind(), "event receiver closed");
            }
        }
    }
}
