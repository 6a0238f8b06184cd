//! Lease documents backing the distributed lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Partition holding every lock document of a collection.
pub const LOCK_PARTITION_KEY: &str = "__distributedlocks__";

/// A lease on a named lock.
///
/// A lock is held while `now <= acquired_at + lease_duration`. Once that
/// passes the document is expired and any contender may take it over, so a
/// crashed holder never blocks others for longer than its lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDocument {
    /// Lock id; also the store document id.
    pub id: String,
    /// Always [`LOCK_PARTITION_KEY`].
    pub partition_key: String,
    /// Random token identifying the acquirer.
    pub owner_token: String,
    /// When the current lease started.
    pub acquired_at: DateTime<Utc>,
    /// Lease length in milliseconds.
    pub lease_duration_ms: u64,
}

impl LockDocument {
    /// Creates a lease starting at `acquired_at`.
    pub fn new(
        lock_id: impl Into<String>,
        owner_token: impl Into<String>,
        acquired_at: DateTime<Utc>,
        lease: Duration,
    ) -> Self {
        Self {
            id: lock_id.into(),
            partition_key: LOCK_PARTITION_KEY.to_string(),
            owner_token: owner_token.into(),
            acquired_at,
            lease_duration_ms: lease.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    /// Lease length.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Instant after which the lease is expired.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let lease_ms = self.lease_duration_ms.min(i64::MAX as u64) as i64;
        let lease = chrono::Duration::milliseconds(lease_ms);
        self.acquired_at
            .checked_add_signed(lease)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}
