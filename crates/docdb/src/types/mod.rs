//! Core data types for the document-store adapter.
//!
//! This module defines the persisted document shapes and the query types
//! exchanged with the upstream query builder:
//!
//! - [`ResourceDocument`] - a versioned resource record (current or history)
//! - [`UpsertResult`] - the outcome of a versioned write
//! - [`LockDocument`] - a lease record backing the distributed lock
//! - [`QueryDescriptor`], [`PaginationState`], [`QueryPage`] - query execution

mod document;
mod lock;
mod query;

pub use document::{
    MAX_LOGICAL_ID_LEN, RawResource, RawResourceFormat, ResourceDocument, ResourceKey,
    UpsertOutcome, UpsertResult,
};
pub use lock::{LOCK_PARTITION_KEY, LockDocument};
pub use query::{
    PaginationState, QueryDescriptor, QueryPage, QueryParameter, QueryPartition, QuerySpec,
    ROOT_ALIAS,
};
