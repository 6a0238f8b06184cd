//! Error types for the document-store adapter.
//!
//! Every public operation returns a [`StoreResult`]. The variants of
//! [`StoreError`] separate expected outcomes of concurrent operation
//! (version conflicts, missing resources, lock contention) from retryable
//! store conditions and from fatal store failures, which are carried
//! unchanged.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::time::Duration;

use thiserror::Error;

use crate::client::DocumentClientError;
use crate::retry::{BackoffHint, RetryDecision, classify};

/// The primary error type for all adapter operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store asked the caller to come back later.
    #[error(transparent)]
    Retryable(#[from] RetryableError),

    /// Optimistic concurrency failures.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Resource state errors.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Distributed lock errors.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Query and pagination errors.
    #[error(transparent)]
    Search(#[from] SearchError),

    /// A caller-supplied argument violated an operation precondition.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The operation was cancelled before the store answered.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other store failure, propagated unmodified.
    #[error("document store failure: {0}")]
    Fatal(#[source] DocumentClientError),
}

/// Store conditions the caller may retry after applying its own policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryableError {
    /// The store reported that it is temporarily unavailable.
    #[error("document store unavailable")]
    Unavailable,

    /// The store throttled the request.
    #[error("request rate exceeded{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

/// Errors related to optimistic concurrency.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// The stored version did not match the caller's expected version.
    #[error("version conflict on {resource_type}/{id}: expected {}", version_or_none(.expected_version))]
    VersionConflict {
        resource_type: String,
        id: String,
        expected_version: Option<String>,
    },
}

fn version_or_none(version: &Option<String>) -> &str {
    version.as_deref().unwrap_or("<none>")
}

/// Errors related to resource state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// The requested resource was not found.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// The requested version of the resource was not found.
    #[error("version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: String,
    },
}

/// Errors related to the distributed lock.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// A non-expired lease for the lock is held by another owner.
    #[error("lock '{lock_id}' is already held")]
    AlreadyHeld { lock_id: String },

    /// The lease expired while work was still running under it.
    #[error("lease on lock '{lock_id}' expired")]
    LeaseExpired { lock_id: String },

    /// The lock could not be obtained within the caller's deadline.
    #[error("timed out after {waited_ms}ms waiting for lock '{lock_id}'")]
    AcquireTimeout { lock_id: String, waited_ms: u64 },
}

/// Errors related to query execution and pagination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The continuation cursor is unknown, expired or already superseded.
    #[error("invalid pagination cursor: {cursor}")]
    InvalidCursor { cursor: String },

    /// The store answered with a response the adapter cannot interpret.
    #[error("unexpected query response: {message}")]
    UnexpectedResponse { message: String },
}

/// Errors related to caller-supplied arguments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("missing required field: {field}")]
    MissingRequiredField { field: String },

    /// An argument is outside its allowed range.
    #[error("invalid argument '{argument}': {message}")]
    InvalidArgument { argument: String, message: String },

    /// Configuration failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Result type alias for adapter operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Maps a store failure through the retry classifier.
    ///
    /// Throttling and unavailability become [`StoreError::Retryable`];
    /// everything else is [`StoreError::Fatal`] and keeps the original error.
    pub fn from_client(err: DocumentClientError) -> Self {
        match classify(&err) {
            RetryDecision::Retryable(BackoffHint::After(retry_after)) => {
                StoreError::Retryable(RetryableError::RateLimited {
                    retry_after: Some(retry_after),
                })
            }
            RetryDecision::Retryable(BackoffHint::Unspecified) => match err {
                DocumentClientError::Throttled { .. } => {
                    StoreError::Retryable(RetryableError::RateLimited { retry_after: None })
                }
                _ => StoreError::Retryable(RetryableError::Unavailable),
            },
            RetryDecision::Fatal => StoreError::Fatal(err),
        }
    }

    /// Returns `true` when the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable(_))
    }

    /// Returns the store-suggested delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::Retryable(RetryableError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn missing_field(field: &str) -> Self {
        StoreError::Validation(ValidationError::MissingRequiredField {
            field: field.to_string(),
        })
    }

    pub(crate) fn invalid_argument(argument: &str, message: impl Into<String>) -> Self {
        StoreError::Validation(ValidationError::InvalidArgument {
            argument: argument.to_string(),
            message: message.into(),
        })
    }
}

impl From<DocumentClientError> for StoreError {
    fn from(err: DocumentClientError) -> Self {
        StoreError::from_client(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Fatal(DocumentClientError::Internal(format!(
            "serialization error: {err}"
        )))
    }
}
