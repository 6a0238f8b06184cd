//! Helios FHIR Server Document Store Adapter
//!
//! This crate lets the Helios FHIR server persist resources in a partitioned,
//! eventually-consistent document store. It adds the guarantees such stores
//! do not give on their own:
//!
//! - **Versioned writes**: optimistic concurrency on the current version and
//!   append-only history, executed atomically as a server-side procedure
//! - **Stable pagination**: cross-partition queries paged behind opaque
//!   cursors that never expose the store's own continuation tokens
//! - **Exclusive upgrades**: a lease-based distributed lock that serializes
//!   collection upgrades across server instances without a coordination
//!   service
//!
//! # Architecture
//!
//! - [`client`] - The store client boundary every component talks through
//! - [`query`] - Single-page query execution and the continuation token cache
//! - [`procedures`] - Versioned upsert and hard delete procedures
//! - [`lock`] - Distributed lock and lease clock
//! - [`retry`] - Retry classification and a caller-side retry policy
//! - [`store`] - The data store façade held by the server
//! - [`upgrade`] - Lock-gated collection upgrades
//! - [`health`] - Read-write health probe
//! - [`backends`] - Store bindings (in-memory, MongoDB)
//!
//! Store throttling and unavailability are never retried inside the adapter.
//! They are returned as [`StoreError::Retryable`] with any delay the store
//! suggested, and the caller decides whether to retry, for example with a
//! [`RetryPolicy`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use helios_docdb::backends::memory::InMemoryDocumentClient;
//! use helios_docdb::cancel::CancellationSignal;
//! use helios_docdb::config::DocumentStoreConfig;
//! use helios_docdb::store::DocumentDataStore;
//! use helios_docdb::types::{
//!     PaginationState, QueryDescriptor, QuerySpec, RawResource, ResourceDocument,
//! };
//!
//! # tokio_test::block_on(async {
//! let store = DocumentDataStore::new(
//!     Arc::new(InMemoryDocumentClient::new()),
//!     &DocumentStoreConfig::default(),
//! )
//! .unwrap();
//! let cancel = CancellationSignal::new();
//!
//! let patient = ResourceDocument::new("Patient", "p1", RawResource::json(r#"{"active":true}"#));
//! let created = store.upsert(patient, None, true, true, &cancel).await.unwrap();
//!
//! let update = ResourceDocument::new("Patient", "p1", RawResource::json(r#"{"active":false}"#));
//! let updated = store
//!     .upsert(update, Some(created.version_id()), false, true, &cancel)
//!     .await
//!     .unwrap();
//! assert_eq!(updated.version_id(), "2");
//!
//! let query = QueryDescriptor::new(
//!     QuerySpec::new("SELECT * FROM root r").with_parameter("@isHistory", false),
//! );
//! let page = store
//!     .search(&query, &PaginationState::first_page(), &cancel)
//!     .await
//!     .unwrap();
//! assert_eq!(page.documents.len(), 1);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lock;
pub mod procedures;
pub mod query;
pub mod retry;
pub mod store;
pub mod types;
pub mod upgrade;

// Re-export commonly used types at crate root
pub use cancel::CancellationSignal;
pub use config::DocumentStoreConfig;
pub use error::{StoreError, StoreResult};
pub use retry::{RetryDecision, RetryPolicy, classify};
pub use store::DocumentDataStore;

// Re-export the client boundary
pub use client::{DocumentClient, DocumentClientError, PartitionScope, StoredProcedure};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
