//! Versioned upsert with history retention.
//!
//! The read-check-write sequence runs as one server-side procedure so that no
//! caller-visible window exists between observing the current version and
//! replacing it. The procedure reports precondition failures with the store's
//! own status codes; [`UpsertProcedure`] maps them onto the adapter's error
//! taxonomy.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancellationSignal;
use crate::client::{DocumentClient, DocumentClientError, PartitionScope, StoredProcedure};
use crate::error::{ConcurrencyError, ResourceError, StoreError, StoreResult};
use crate::types::{ResourceDocument, UpsertOutcome, UpsertResult};

/// Arguments passed to [`UpsertWithHistory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertArgs {
    /// Document to write.
    pub document: ResourceDocument,
    /// Version the caller last observed, if the write is conditional.
    #[serde(default)]
    pub match_version_id: Option<String>,
    /// Whether the write may create the resource.
    pub allow_create: bool,
    /// Whether to retain the superseded version as a history record.
    pub keep_history: bool,
}

/// Server-side body of the versioned upsert.
///
/// Fails with [`DocumentClientError::PreconditionFailed`] when
/// `matchVersionId` does not name the stored version (or there is none),
/// and with [`DocumentClientError::NotFound`] when the resource is absent
/// and creation is not allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertWithHistory;

impl UpsertWithHistory {
    fn next_version(current: &ResourceDocument) -> String {
        (current.version_number().unwrap_or(0) + 1).to_string()
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, DocumentClientError> {
    serde_json::to_value(value).map_err(|e| DocumentClientError::Internal(e.to_string()))
}

#[async_trait]
impl StoredProcedure for UpsertWithHistory {
    fn name(&self) -> &'static str {
        "upsertWithHistory"
    }

    fn version(&self) -> u32 {
        1
    }

    async fn execute(
        &self,
        scope: &mut dyn PartitionScope,
        args: Value,
    ) -> Result<Value, DocumentClientError> {
        let args: UpsertArgs = serde_json::from_value(args)
            .map_err(|e| DocumentClientError::InvalidInput(e.to_string()))?;
        let document = args.document;

        if document.partition_key() != scope.partition_key() {
            return Err(DocumentClientError::InvalidInput(format!(
                "document partition '{}' does not match procedure partition '{}'",
                document.partition_key(),
                scope.partition_key()
            )));
        }

        let now = Utc::now();
        let Some(stored) = scope.read(document.resource_id()).await? else {
            if args.match_version_id.is_some() {
                return Err(DocumentClientError::PreconditionFailed);
            }
            if !args.allow_create {
                return Err(DocumentClientError::NotFound);
            }

            let created = document.into_current("1".to_string(), now);
            scope.create(to_body(&created)?).await?;
            return to_body(&UpsertResult {
                outcome: UpsertOutcome::Created,
                document: created,
            });
        };

        let current: ResourceDocument = serde_json::from_value(stored.body)
            .map_err(|e| DocumentClientError::Internal(format!("corrupt current document: {e}")))?;

        // Never supersede a record that belongs to another resource or version.
        if !current.is_current_of(document.resource_id()) {
            return Err(DocumentClientError::InvalidInput(format!(
                "document id '{}' is taken by another record",
                document.resource_id()
            )));
        }

        if let Some(expected) = &args.match_version_id {
            if expected != current.version() {
                return Err(DocumentClientError::PreconditionFailed);
            }
        }

        // Deleting an already-deleted resource does not mint a new version.
        if current.is_deleted() && document.is_deleted() {
            return to_body(&UpsertResult {
                outcome: UpsertOutcome::Updated,
                document: current,
            });
        }

        let next_version = Self::next_version(&current);
        if args.keep_history {
            scope.create(to_body(&current.into_history())?).await?;
        }

        let updated = document.into_current(next_version, now);
        scope.replace(to_body(&updated)?, &stored.etag).await?;

        to_body(&UpsertResult {
            outcome: UpsertOutcome::Updated,
            document: updated,
        })
    }
}

/// Client-side entry point for versioned writes.
#[derive(Debug, Clone)]
pub struct UpsertProcedure {
    client: Arc<dyn DocumentClient>,
    collection: String,
}

impl UpsertProcedure {
    /// Creates a procedure bound to `collection`.
    pub fn new(client: Arc<dyn DocumentClient>, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Writes `document` as the new current version of its resource.
    ///
    /// Returns [`ConcurrencyError::VersionConflict`] when `match_version_id`
    /// is stale, or when another writer created the resource first, and
    /// [`ResourceError::NotFound`] when the resource is absent and
    /// `allow_create` is false.
    pub async fn execute(
        &self,
        document: ResourceDocument,
        match_version_id: Option<&str>,
        allow_create: bool,
        keep_history: bool,
        cancel: &CancellationSignal,
    ) -> StoreResult<UpsertResult> {
        document.validate()?;
        if matches!(match_version_id, Some("")) {
            return Err(StoreError::invalid_argument(
                "match_version_id",
                "must not be empty",
            ));
        }

        let resource_type = document.resource_type().to_string();
        let id = document.resource_id().to_string();
        let partition_key = document.partition_key().to_string();

        let args = serde_json::to_value(UpsertArgs {
            document,
            match_version_id: match_version_id.map(str::to_string),
            allow_create,
            keep_history,
        })?;

        let result = cancel
            .run(async {
                self.client
                    .execute_procedure(&self.collection, &partition_key, &UpsertWithHistory, args)
                    .await
                    .map_err(|err| match err {
                        DocumentClientError::PreconditionFailed | DocumentClientError::Conflict => {
                            StoreError::Concurrency(ConcurrencyError::VersionConflict {
                                resource_type: resource_type.clone(),
                                id: id.clone(),
                                expected_version: match_version_id.map(str::to_string),
                            })
                        }
                        DocumentClientError::NotFound => {
                            StoreError::Resource(ResourceError::NotFound {
                                resource_type: resource_type.clone(),
                                id: id.clone(),
                            })
                        }
                        other => StoreError::from_client(other),
                    })
            })
            .await;

        match result {
            Ok(value) => {
                let result: UpsertResult = serde_json::from_value(value)?;
                tracing::debug!(
                    resource_type = %resource_type,
                    id = %id,
                    version = %result.version_id(),
                    outcome = ?result.outcome,
                    "upserted resource"
                );
                Ok(result)
            }
            Err(err) => {
                tracing::debug!(
                    resource_type = %resource_type,
                    id = %id,
                    error = %err,
                    "upsert rejected"
                );
                Err(err)
            }
        }
    }
}
