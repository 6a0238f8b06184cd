//! Distributed locking across server instances.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use helios_docdb::backends::memory::InMemoryDocumentClient;
//! use helios_docdb::cancel::CancellationSignal;
//! use helios_docdb::lock::{DistributedLockFactory, ReleaseOutcome};
//!
//! # tokio_test::block_on(async {
//! let client = Arc::new(InMemoryDocumentClient::new());
//! let factory = DistributedLockFactory::new(client, "fhir");
//! let cancel = CancellationSignal::new();
//!
//! let lock = factory.create("migration-lock").unwrap();
//! let handle = lock.acquire(Duration::from_secs(30), &cancel).await.unwrap();
//! assert!(!lock.is_expired(&handle));
//!
//! let outcome = lock.release(&handle, &cancel).await.unwrap();
//! assert_eq!(outcome, ReleaseOutcome::Released);
//! # });
//! ```

mod clock;
mod distributed;

pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedLock, DistributedLockFactory, LockHandle, ReleaseOutcome};
