//! Document-store client boundary.
//!
//! The adapter talks to the remote store exclusively through
//! [`DocumentClient`]: point reads, conditional point writes, deletes,
//! paginated queries and server-side procedure execution, all scoped by a
//! partition key. Store failures surface as [`DocumentClientError`], which
//! carries the store's status signal for the retry classifier.
//!
//! Server-side procedures implement [`StoredProcedure`] and run against a
//! [`PartitionScope`]. A client must commit everything a procedure does
//! through its scope atomically, or nothing at all.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::QuerySpec;

/// Failure reported by the document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentClientError {
    /// The addressed document does not exist (404).
    #[error("document not found")]
    NotFound,

    /// A document with the same identity already exists (409).
    #[error("document already exists")]
    Conflict,

    /// A write precondition (etag match) failed (412).
    #[error("precondition failed")]
    PreconditionFailed,

    /// The request rate exceeded the provisioned throughput (429).
    #[error("request rate is too large")]
    Throttled {
        /// Store-suggested delay before retrying.
        retry_after: Option<Duration>,
    },

    /// The store is temporarily unable to serve requests (503).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time (408).
    #[error("request timed out")]
    Timeout,

    /// The request was rejected as malformed (400).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any other store-side failure (500).
    #[error("internal store error: {0}")]
    Internal(String),
}

impl DocumentClientError {
    /// HTTP-style status code the store associates with this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            DocumentClientError::NotFound => 404,
            DocumentClientError::Conflict => 409,
            DocumentClientError::PreconditionFailed => 412,
            DocumentClientError::Throttled { .. } => 429,
            DocumentClientError::Unavailable(_) => 503,
            DocumentClientError::Timeout => 408,
            DocumentClientError::InvalidInput(_) => 400,
            DocumentClientError::Internal(_) => 500,
        }
    }
}

/// A document as returned by the store, with its concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Document body. Always an object with a string `id` field.
    pub body: Value,
    /// Opaque etag assigned by the store on every write.
    pub etag: String,
}

/// Precondition attached to a point write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteCondition {
    /// Unconditional upsert.
    #[default]
    None,
    /// Create only; fails with [`DocumentClientError::Conflict`] if the id exists.
    IfNoneMatch,
    /// Replace only when the stored etag equals the given one.
    IfMatch(String),
}

/// One page request against a collection.
#[derive(Debug, Clone)]
pub struct FeedRequest {
    /// Query text and parameters.
    pub query: QuerySpec,
    /// Restrict the query to a single partition.
    pub partition_key: Option<String>,
    /// Allow the store to fan the query out over all partitions.
    pub enable_cross_partition: bool,
    /// Upper bound on items in the page.
    pub max_item_count: u32,
    /// Raw store continuation to resume from.
    pub continuation: Option<String>,
    /// Ask for a single aggregate count item instead of documents.
    pub count_only: bool,
}

/// One page returned by the store.
#[derive(Debug, Clone, Default)]
pub struct FeedResponse {
    /// Returned items, in store order.
    pub items: Vec<Value>,
    /// Raw continuation for the next page; `None` or empty at the end.
    pub continuation: Option<String>,
    /// Store-assigned request identifier.
    pub activity_id: String,
    /// Cost the store charged for the request.
    pub request_charge: f64,
}

/// Client for a partitioned document store.
#[async_trait]
pub trait DocumentClient: Send + Sync + Debug {
    /// Short name of the store binding, used in log events.
    fn name(&self) -> &'static str;

    /// Reads one document by id within a partition.
    async fn read_document(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, DocumentClientError>;

    /// Writes one document under the given precondition.
    async fn write_document(
        &self,
        collection: &str,
        partition_key: &str,
        document: Value,
        condition: WriteCondition,
    ) -> Result<StoredDocument, DocumentClientError>;

    /// Deletes one document. Fails with [`DocumentClientError::NotFound`]
    /// when absent and [`DocumentClientError::PreconditionFailed`] when
    /// `if_match` does not match the stored etag.
    async fn delete_document(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), DocumentClientError>;

    /// Fetches exactly one page of query results.
    async fn query_documents(
        &self,
        collection: &str,
        request: &FeedRequest,
    ) -> Result<FeedResponse, DocumentClientError>;

    /// Runs a procedure atomically against one partition.
    async fn execute_procedure(
        &self,
        collection: &str,
        partition_key: &str,
        procedure: &dyn StoredProcedure,
        args: Value,
    ) -> Result<Value, DocumentClientError>;
}

/// Partition-local view a [`StoredProcedure`] operates on.
#[async_trait]
pub trait PartitionScope: Send {
    /// The partition this scope is bound to.
    fn partition_key(&self) -> &str;

    /// Reads a document by id.
    async fn read(&mut self, id: &str) -> Result<Option<StoredDocument>, DocumentClientError>;

    /// Returns every document whose top-level `field` equals `value`.
    async fn find(
        &mut self,
        field: &str,
        value: &Value,
    ) -> Result<Vec<StoredDocument>, DocumentClientError>;

    /// Creates a document; fails with [`DocumentClientError::Conflict`] if the id exists.
    async fn create(&mut self, document: Value) -> Result<StoredDocument, DocumentClientError>;

    /// Replaces a document whose stored etag equals `if_match`.
    async fn replace(
        &mut self,
        document: Value,
        if_match: &str,
    ) -> Result<StoredDocument, DocumentClientError>;

    /// Deletes a document by id.
    async fn delete(&mut self, id: &str) -> Result<(), DocumentClientError>;
}

/// Server-side procedure executed atomically within one partition.
#[async_trait]
pub trait StoredProcedure: Send + Sync + Debug {
    /// Procedure name.
    fn name(&self) -> &'static str;

    /// Body version, bumped whenever the procedure's behavior changes.
    fn version(&self) -> u32;

    /// Installed name. Distinct bodies never share a full name.
    fn full_name(&self) -> String {
        format!("{}_v{}", self.name(), self.version())
    }

    /// Runs the procedure body.
    async fn execute(
        &self,
        scope: &mut dyn PartitionScope,
        args: Value,
    ) -> Result<Value, DocumentClientError>;
}

/// Extracts the mandatory `id` field of a document body.
pub fn document_id(document: &Value) -> Result<&str, DocumentClientError> {
    document
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DocumentClientError::InvalidInput("document has no 'id'".to_string()))
}
