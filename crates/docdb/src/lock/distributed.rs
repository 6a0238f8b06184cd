//! Lease-based distributed lock.
//!
//! A lock is a single [`LockDocument`] in the lock partition. Acquisition is
//! a create-if-absent write, so mutual exclusion rests on the store's
//! uniqueness check for one document id. An expired lease is taken over with
//! a compare-and-swap on the document's etag. Release and renewal are
//! compare-and-delete and compare-and-swap on the owner token.
//!
//! Nothing here polls or retries: contention is reported as
//! [`LockError::AlreadyHeld`] and the caller decides when to try again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use crate::cancel::CancellationSignal;
use crate::client::{DocumentClient, DocumentClientError, StoredDocument, WriteCondition};
use crate::error::{LockError, StoreError, StoreResult};
use crate::types::{LOCK_PARTITION_KEY, LockDocument};

/// Proof of a held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    lock_id: String,
    owner_token: String,
    acquired_at: DateTime<Utc>,
    lease: Duration,
    etag: String,
}

impl LockHandle {
    fn from_stored(document: &LockDocument, stored: StoredDocument) -> Self {
        Self {
            lock_id: document.id.clone(),
            owner_token: document.owner_token.clone(),
            acquired_at: document.acquired_at,
            lease: document.lease(),
            etag: stored.etag,
        }
    }

    /// Lock id.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Token identifying this holder.
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Start of the current lease.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Lease length.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Instant after which the lease is expired.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.document().expires_at()
    }

    fn document(&self) -> LockDocument {
        LockDocument::new(
            &self.lock_id,
            &self.owner_token,
            self.acquired_at,
            self.lease,
        )
    }
}

/// Result of releasing a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease was ours and has been removed.
    Released,
    /// The lease had already been removed or taken over by another owner.
    Lost,
}

/// Creates [`DistributedLock`]s bound to one collection.
#[derive(Debug, Clone)]
pub struct DistributedLockFactory {
    client: Arc<dyn DocumentClient>,
    collection: String,
    clock: Arc<dyn Clock>,
}

impl DistributedLockFactory {
    /// Creates a factory using the system clock.
    pub fn new(client: Arc<dyn DocumentClient>, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for lease arithmetic.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns a lock for `lock_id`. Does not touch the store.
    pub fn create(&self, lock_id: &str) -> StoreResult<DistributedLock> {
        if lock_id.is_empty() {
            return Err(StoreError::invalid_argument("lock_id", "must not be empty"));
        }

        Ok(DistributedLock {
            client: self.client.clone(),
            collection: self.collection.clone(),
            clock: self.clock.clone(),
            lock_id: lock_id.to_string(),
        })
    }

    /// Creates the lock for `lock_id` and tries to acquire it once.
    pub async fn acquire(
        &self,
        lock_id: &str,
        lease: Duration,
        cancel: &CancellationSignal,
    ) -> StoreResult<(DistributedLock, LockHandle)> {
        let lock = self.create(lock_id)?;
        let handle = lock.acquire(lease, cancel).await?;
        Ok((lock, handle))
    }
}

/// A named lease-based lock.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    client: Arc<dyn DocumentClient>,
    collection: String,
    clock: Arc<dyn Clock>,
    lock_id: String,
}

impl DistributedLock {
    /// Lock id.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Tries once to take the lock for `lease`.
    ///
    /// Fails with [`LockError::AlreadyHeld`] while another owner holds an
    /// unexpired lease.
    pub async fn acquire(
        &self,
        lease: Duration,
        cancel: &CancellationSignal,
    ) -> StoreResult<LockHandle> {
        if lease.is_zero() {
            return Err(StoreError::invalid_argument("lease", "must be greater than zero"));
        }

        cancel.run(self.try_acquire(lease)).await
    }

    async fn try_acquire(&self, lease: Duration) -> StoreResult<LockHandle> {
        let document = LockDocument::new(
            &self.lock_id,
            Uuid::new_v4().to_string(),
            self.clock.now(),
            lease,
        );

        match self.write(&document, WriteCondition::IfNoneMatch).await {
            Ok(stored) => {
                tracing::info!(
                    lock_id = %self.lock_id,
                    lease_ms = document.lease_duration_ms,
                    "acquired distributed lock"
                );
                return Ok(LockHandle::from_stored(&document, stored));
            }
            Err(DocumentClientError::Conflict) => {}
            Err(err) => return Err(StoreError::from_client(err)),
        }

        let Some((current, etag)) = self.read().await? else {
            // The holder released between our create and read; one more try.
            return match self.write(&document, WriteCondition::IfNoneMatch).await {
                Ok(stored) => Ok(LockHandle::from_stored(&document, stored)),
                Err(DocumentClientError::Conflict) => Err(self.already_held()),
                Err(err) => Err(StoreError::from_client(err)),
            };
        };

        if !current.is_expired_at(self.clock.now()) {
            tracing::debug!(lock_id = %self.lock_id, "distributed lock is held");
            return Err(self.already_held());
        }

        match self.write(&document, WriteCondition::IfMatch(etag)).await {
            Ok(stored) => {
                tracing::warn!(
                    lock_id = %self.lock_id,
                    expired_at = %current.expires_at(),
                    "took over expired distributed lock"
                );
                Ok(LockHandle::from_stored(&document, stored))
            }
            Err(DocumentClientError::PreconditionFailed | DocumentClientError::NotFound) => {
                Err(self.already_held())
            }
            Err(err) => Err(StoreError::from_client(err)),
        }
    }

    /// Removes the lease if `handle` still owns it.
    pub async fn release(
        &self,
        handle: &LockHandle,
        cancel: &CancellationSignal,
    ) -> StoreResult<ReleaseOutcome> {
        self.check_handle(handle)?;
        cancel.run(self.try_release(handle)).await
    }

    async fn try_release(&self, handle: &LockHandle) -> StoreResult<ReleaseOutcome> {
        let Some((current, etag)) = self.read().await? else {
            tracing::warn!(lock_id = %self.lock_id, "lock was gone at release");
            return Ok(ReleaseOutcome::Lost);
        };

        if current.owner_token != handle.owner_token {
            tracing::warn!(lock_id = %self.lock_id, "lock was taken over before release");
            return Ok(ReleaseOutcome::Lost);
        }

        match self
            .client
            .delete_document(&self.collection, LOCK_PARTITION_KEY, &self.lock_id, Some(&etag))
            .await
        {
            Ok(()) => {
                tracing::info!(lock_id = %self.lock_id, "released distributed lock");
                Ok(ReleaseOutcome::Released)
            }
            Err(DocumentClientError::PreconditionFailed | DocumentClientError::NotFound) => {
                tracing::warn!(lock_id = %self.lock_id, "lock changed during release");
                Ok(ReleaseOutcome::Lost)
            }
            Err(err) => Err(StoreError::from_client(err)),
        }
    }

    /// Restarts the lease of `handle` from now.
    ///
    /// Fails with [`LockError::LeaseExpired`] when the lease is no longer
    /// owned by `handle`.
    pub async fn renew(
        &self,
        handle: &mut LockHandle,
        cancel: &CancellationSignal,
    ) -> StoreResult<()> {
        self.check_handle(handle)?;
        let renewed = cancel.run(self.try_renew(handle)).await?;
        *handle = renewed;
        Ok(())
    }

    async fn try_renew(&self, handle: &LockHandle) -> StoreResult<LockHandle> {
        let lost = || {
            StoreError::Lock(LockError::LeaseExpired {
                lock_id: self.lock_id.clone(),
            })
        };

        let Some((current, etag)) = self.read().await? else {
            return Err(lost());
        };
        if current.owner_token != handle.owner_token {
            return Err(lost());
        }

        let document = LockDocument::new(
            &self.lock_id,
            &handle.owner_token,
            self.clock.now(),
            handle.lease,
        );
        match self.write(&document, WriteCondition::IfMatch(etag)).await {
            Ok(stored) => {
                tracing::debug!(lock_id = %self.lock_id, "renewed distributed lock");
                Ok(LockHandle::from_stored(&document, stored))
            }
            Err(DocumentClientError::PreconditionFailed | DocumentClientError::NotFound) => {
                Err(lost())
            }
            Err(err) => Err(StoreError::from_client(err)),
        }
    }

    /// Whether the lease behind `handle` has lapsed by the lock's clock.
    pub fn is_expired(&self, handle: &LockHandle) -> bool {
        self.clock.now() > handle.expires_at()
    }

    fn check_handle(&self, handle: &LockHandle) -> StoreResult<()> {
        if handle.lock_id != self.lock_id {
            return Err(StoreError::invalid_argument(
                "handle",
                format!("handle is for lock '{}'", handle.lock_id),
            ));
        }
        Ok(())
    }

    fn already_held(&self) -> StoreError {
        StoreError::Lock(LockError::AlreadyHeld {
            lock_id: self.lock_id.clone(),
        })
    }

    async fn read(&self) -> StoreResult<Option<(LockDocument, String)>> {
        let stored = self
            .client
            .read_document(&self.collection, LOCK_PARTITION_KEY, &self.lock_id)
            .await?;

        match stored {
            Some(stored) => {
                let document: LockDocument = serde_json::from_value(stored.body)?;
                Ok(Some((document, stored.etag)))
            }
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        document: &LockDocument,
        condition: WriteCondition,
    ) -> Result<StoredDocument, DocumentClientError> {
        let body = serde_json::to_value(document)
            .map_err(|e| DocumentClientError::Internal(e.to_string()))?;
        self.client
            .write_document(&self.collection, LOCK_PARTITION_KEY, body, condition)
            .await
    }
}
