//! Lock-gated collection upgrades.
//!
//! Several server instances may start at once against the same collection.
//! [`CollectionUpgradeManager`] makes sure only one of them runs the
//! registered [`CollectionUpdater`]s at a time: it polls for the upgrade
//! lock, checks the lease before every step and releases the lock when done.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cancel::CancellationSignal;
use crate::client::DocumentClient;
use crate::config::UpgradeConfig;
use crate::error::{LockError, StoreError, StoreResult};
use crate::lock::{DistributedLock, DistributedLockFactory, LockHandle, ReleaseOutcome};

/// One step of a collection upgrade.
///
/// Steps must be idempotent: an instance that loses its lease mid-run leaves
/// the remaining steps to whichever instance takes the lock next.
#[async_trait]
pub trait CollectionUpdater: Send + Sync + Debug {
    /// Name used in logs and in the upgrade report.
    fn name(&self) -> &str;

    /// Applies the step.
    async fn apply(
        &self,
        client: &dyn DocumentClient,
        collection: &str,
        cancel: &CancellationSignal,
    ) -> StoreResult<()>;
}

/// Runs collection updaters under the upgrade lock.
#[derive(Debug, Clone)]
pub struct CollectionUpgradeManager {
    client: Arc<dyn DocumentClient>,
    collection: String,
    locks: DistributedLockFactory,
    config: UpgradeConfig,
    updaters: Vec<Arc<dyn CollectionUpdater>>,
}

impl CollectionUpgradeManager {
    /// Creates a manager with no updaters.
    pub fn new(
        client: Arc<dyn DocumentClient>,
        collection: impl Into<String>,
        config: UpgradeConfig,
    ) -> Self {
        let collection = collection.into();
        Self {
            locks: DistributedLockFactory::new(client.clone(), &collection),
            client,
            collection,
            config,
            updaters: Vec::new(),
        }
    }

    /// Replaces the lock factory, e.g. to use a different clock.
    pub fn with_lock_factory(mut self, locks: DistributedLockFactory) -> Self {
        self.locks = locks;
        self
    }

    /// Appends an updater. Updaters run in registration order.
    pub fn with_updater(mut self, updater: Arc<dyn CollectionUpdater>) -> Self {
        self.updaters.push(updater);
        self
    }

    /// Runs every updater while holding the upgrade lock.
    ///
    /// # Returns
    ///
    /// Names of the updaters that were applied, in order.
    ///
    /// # Errors
    ///
    /// * `StoreError::Lock(AcquireTimeout)` - If the lock stayed held past `acquire_timeout`
    /// * `StoreError::Lock(LeaseExpired)` - If the lease lapsed before a step could start
    /// * Any error returned by an updater
    pub async fn run(&self, cancel: &CancellationSignal) -> StoreResult<Vec<String>> {
        let lock = self.locks.create(&self.config.lock_id)?;
        let handle = self.acquire(&lock, cancel).await?;

        let result = self.apply_all(&lock, &handle, cancel).await;

        // Release even when cancelled so the next instance need not wait out the lease.
        match lock.release(&handle, &CancellationSignal::new()).await {
            Ok(ReleaseOutcome::Released) => {}
            Ok(ReleaseOutcome::Lost) => {
                warn!(
                    lock_id = %self.config.lock_id,
                    "upgrade lock was lost before release"
                )
            }
            Err(err) => {
                warn!(
                    lock_id = %self.config.lock_id,
                    error = %err,
                    "failed to release upgrade lock"
                )
            }
        }

        result
    }

    async fn acquire(
        &self,
        lock: &DistributedLock,
        cancel: &CancellationSignal,
    ) -> StoreResult<LockHandle> {
        let started = Instant::now();
        loop {
            match lock.acquire(self.config.lease, cancel).await {
                Ok(handle) => return Ok(handle),
                Err(StoreError::Lock(LockError::AlreadyHeld { .. })) => {}
                Err(err) => return Err(err),
            }

            let waited = started.elapsed();
            if waited + self.config.poll_interval > self.config.acquire_timeout {
                return Err(StoreError::Lock(LockError::AcquireTimeout {
                    lock_id: self.config.lock_id.clone(),
                    waited_ms: waited.as_millis() as u64,
                }));
            }

            info!(
                lock_id = %self.config.lock_id,
                "upgrade lock is held by another instance, waiting"
            );
            cancel.sleep(self.config.poll_interval).await?;
        }
    }

    async fn apply_all(
        &self,
        lock: &DistributedLock,
        handle: &LockHandle,
        cancel: &CancellationSignal,
    ) -> StoreResult<Vec<String>> {
        let mut applied = Vec::with_capacity(self.updaters.len());

        for updater in &self.updaters {
            if lock.is_expired(handle) {
                warn!(
                    lock_id = %self.config.lock_id,
                    next = updater.name(),
                    "upgrade lease expired, abandoning run"
                );
                return Err(StoreError::Lock(LockError::LeaseExpired {
                    lock_id: self.config.lock_id.clone(),
                }));
            }

            updater
                .apply(self.client.as_ref(), &self.collection, cancel)
                .await?;
            info!(updater = updater.name(), "applied collection updater");
            applied.push(updater.name().to_string());
        }

        Ok(applied)
    }
}
