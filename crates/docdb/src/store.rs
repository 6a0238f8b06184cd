//! Data store façade.
//!
//! [`DocumentDataStore`] wires one store client to the query executor, the
//! versioned write procedures and the lock factory for a single collection.
//! It is what the hosting server holds on to.

use std::sync::Arc;

use crate::cancel::CancellationSignal;
use crate::client::DocumentClient;
use crate::config::DocumentStoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::lock::DistributedLockFactory;
use crate::procedures::{HardDeleteProcedure, UpsertProcedure};
use crate::query::{ContinuationTokenCache, InMemoryContinuationTokenCache, QueryExecutor};
use crate::types::{
    PaginationState, QueryDescriptor, QueryPage, ResourceDocument, ResourceKey, UpsertResult,
};

/// Versioned resource storage over a partitioned document store.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use helios_docdb::backends::memory::InMemoryDocumentClient;
/// use helios_docdb::cancel::CancellationSignal;
/// use helios_docdb::config::DocumentStoreConfig;
/// use helios_docdb::store::DocumentDataStore;
/// use helios_docdb::types::{RawResource, ResourceDocument, UpsertOutcome};
///
/// # tokio_test::block_on(async {
/// let store = DocumentDataStore::new(
///     Arc::new(InMemoryDocumentClient::new()),
///     &DocumentStoreConfig::default(),
/// )
/// .unwrap();
/// let cancel = CancellationSignal::new();
///
/// let document = ResourceDocument::new("Patient", "p1", RawResource::json("{}"));
/// let result = store.upsert(document, None, true, true, &cancel).await.unwrap();
///
/// assert_eq!(result.outcome, UpsertOutcome::Created);
/// assert_eq!(result.version_id(), "1");
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct DocumentDataStore {
    client: Arc<dyn DocumentClient>,
    collection: String,
    query: QueryExecutor,
    upsert: UpsertProcedure,
    hard_delete: HardDeleteProcedure,
}

impl DocumentDataStore {
    /// Creates a store with an in-process continuation cache.
    ///
    /// # Errors
    ///
    /// * `StoreError::Validation` - If the configuration is invalid
    pub fn new(client: Arc<dyn DocumentClient>, config: &DocumentStoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let cache = Arc::new(InMemoryContinuationTokenCache::new(
            config.continuation_cache.clone(),
        ));
        Ok(Self::with_cache(client, cache, &config.collection))
    }

    /// Creates a store using an externally managed continuation cache.
    pub fn with_cache(
        client: Arc<dyn DocumentClient>,
        cache: Arc<dyn ContinuationTokenCache>,
        collection: impl Into<String>,
    ) -> Self {
        let collection = collection.into();
        tracing::debug!(
            backend = client.name(),
            collection = %collection,
            "creating document data store"
        );

        Self {
            query: QueryExecutor::new(client.clone(), cache, &collection),
            upsert: UpsertProcedure::new(client.clone(), &collection),
            hard_delete: HardDeleteProcedure::new(client.clone(), &collection),
            client,
            collection,
        }
    }

    /// Collection this store writes to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns a lock factory bound to the same collection.
    pub fn lock_factory(&self) -> DistributedLockFactory {
        DistributedLockFactory::new(self.client.clone(), &self.collection)
    }

    /// Writes a new version of a resource.
    ///
    /// # Arguments
    ///
    /// * `document` - The resource to write
    /// * `match_version_id` - The version the caller last observed, if conditional
    /// * `allow_create` - Whether the write may create the resource
    /// * `keep_history` - Whether to retain the superseded version
    ///
    /// # Errors
    ///
    /// * `StoreError::Concurrency(VersionConflict)` - If `match_version_id` is stale
    /// * `StoreError::Resource(NotFound)` - If the resource is absent and `allow_create` is false
    /// * `StoreError::Retryable` - If the store throttled or was unavailable
    pub async fn upsert(
        &self,
        document: ResourceDocument,
        match_version_id: Option<&str>,
        allow_create: bool,
        keep_history: bool,
        cancel: &CancellationSignal,
    ) -> StoreResult<UpsertResult> {
        self.upsert
            .execute(document, match_version_id, allow_create, keep_history, cancel)
            .await
    }

    /// Reads the current version of a resource.
    ///
    /// Soft-deleted resources are returned with their delete marker set.
    ///
    /// # Returns
    ///
    /// The current document, or `None` if the resource was never written or
    /// has been hard deleted.
    pub async fn read(
        &self,
        resource_type: &str,
        id: &str,
        cancel: &CancellationSignal,
    ) -> StoreResult<Option<ResourceDocument>> {
        let key = ResourceKey::new(resource_type, id);
        let document = self.read_document(&key.partition_key(), id, cancel).await?;
        Ok(document.filter(|document| document.is_current_of(id)))
    }

    /// Reads a specific version of a resource.
    ///
    /// # Returns
    ///
    /// The current document when `version_id` is the current version, the
    /// retained history record otherwise, or `None` when that version was
    /// not kept.
    pub async fn read_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
        cancel: &CancellationSignal,
    ) -> StoreResult<Option<ResourceDocument>> {
        if version_id.is_empty() {
            return Err(StoreError::invalid_argument("version_id", "must not be empty"));
        }

        let key = ResourceKey::with_version(resource_type, id, version_id);
        let partition_key = key.partition_key();

        if let Some(current) = self.read_document(&partition_key, id, cancel).await? {
            if current.is_current_of(id) && current.version() == version_id {
                return Ok(Some(current));
            }
        }

        let history = self
            .read_document(&partition_key, &key.history_document_id(version_id), cancel)
            .await?;
        Ok(history.filter(|document| document.is_history_of(id, version_id)))
    }

    /// Permanently removes a resource and all of its history.
    ///
    /// # Returns
    ///
    /// The removed version ids; empty if nothing was stored.
    pub async fn hard_delete(
        &self,
        resource_type: &str,
        id: &str,
        cancel: &CancellationSignal,
    ) -> StoreResult<Vec<String>> {
        self.hard_delete.execute(id, resource_type, cancel).await
    }

    /// Fetches one page of query results.
    ///
    /// # Errors
    ///
    /// * `StoreError::Search(InvalidCursor)` - If the cursor is unknown, expired or superseded
    /// * `StoreError::Retryable` - If the store throttled or was unavailable
    pub async fn search(
        &self,
        descriptor: &QueryDescriptor,
        pagination: &PaginationState,
        cancel: &CancellationSignal,
    ) -> StoreResult<QueryPage> {
        self.query.execute(descriptor, pagination, cancel).await
    }

    async fn read_document(
        &self,
        partition_key: &str,
        document_id: &str,
        cancel: &CancellationSignal,
    ) -> StoreResult<Option<ResourceDocument>> {
        let stored = cancel
            .run(async {
                self.client
                    .read_document(&self.collection, partition_key, document_id)
                    .await
                    .map_err(StoreError::from_client)
            })
            .await?;

        match stored {
            Some(stored) => Ok(Some(serde_json::from_value(stored.body)?)),
            None => Ok(None),
        }
    }
}
