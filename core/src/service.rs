//! Service lifecycle for the credential pool
//!
//! `CredentialBroker` owns one shared allocator and the background recovery
//! task. Construct it once at startup, `start` it inside a tokio runtime and
//! `shutdown` it before the runtime goes away.

use crate::{
    allocator::PoolAllocator, config::PoolConfig, errors::PoolError,
    scheduler::RecoveryScheduler,
};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct RecoveryTask {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// Shared credential pool with its recovery scheduler
///
/// # Example
///
/// ```rust
/// use pool_machines::{CredentialBroker, PoolConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), pool_machines::PoolError> {
/// let config = PoolConfig::from_toml_str(r#"
///     [[credentials]]
///     id = "primary"
/// "#)?;
///
/// let broker = CredentialBroker::init(config)?;
/// broker.start()?;
///
/// let credential = broker.allocate(None)?;
/// broker.report_success(&credential.id, Some(85.0));
/// broker.release(&credential.id);
///
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct CredentialBroker {
    allocator: Arc<PoolAllocator>,
    task: Mutex<Option<RecoveryTask>>,
}

impl CredentialBroker {
    /// Build the allocator from configuration; nothing runs until `start`
    pub fn init(config: PoolConfig) -> Result<Self, PoolError> {
        Ok(Self::from_allocator(PoolAllocator::new(config)?))
    }

    pub fn from_allocator(allocator: PoolAllocator) -> Self {
        Self {
            allocator: Arc::new(allocator),
            task: Mutex::new(None),
        }
    }

    /// Shared handle to the allocator
    pub fn allocator(&self) -> &Arc<PoolAllocator> {
        &self.allocator
    }

    /// Start the recovery scheduler on the current tokio runtime
    ///
    /// Calling `start` while the scheduler is running is a no-op.
    pub fn start(&self) -> Result<(), PoolError> {
        let runtime = Handle::try_current().map_err(|e| PoolError::Runtime(e.to_string()))?;

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }

        let token = CancellationToken::new();
        let scheduler = RecoveryScheduler::new(Arc::clone(self.allocator.health()));
        let interval = scheduler.interval();
        let handle = runtime.spawn(scheduler.run(token.clone()));

        *task = Some(RecoveryTask { handle, token });
        info!(
            credentials = self.allocator.registry().len(),
            interval_secs = interval.as_secs_f64(),
            "credential broker started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Cancel the recovery scheduler and wait for it to stop
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };

        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "recovery scheduler ended abnormally");
        }
        info!("credential broker stopped");
    }
}

impl Deref for CredentialBroker {
    type Target = PoolAllocator;

    fn deref(&self) -> &Self::Target {
        &self.allocator
    }
}

impl Drop for CredentialBroker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.token.cancel();
        }
    }
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("allocator", &self.allocator)
            .field("running", &self.is_running())
            .finish()
    }
}
