//! Permanent removal of a resource and its history.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancellationSignal;
use crate::client::{DocumentClient, DocumentClientError, PartitionScope, StoredProcedure};
use crate::error::{StoreError, StoreResult};
use crate::types::ResourceDocument;

/// Arguments passed to [`HardDeleteResource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardDeleteArgs {
    /// Resource type.
    pub resource_type: String,
    /// Logical id.
    pub resource_id: String,
}

/// Server-side body of the hard delete.
///
/// Removes the current document and every history document of one logical
/// id and returns the version ids it removed, oldest first.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardDeleteResource;

#[async_trait]
impl StoredProcedure for HardDeleteResource {
    fn name(&self) -> &'static str {
        "hardDelete"
    }

    fn version(&self) -> u32 {
        1
    }

    async fn execute(
        &self,
        scope: &mut dyn PartitionScope,
        args: Value,
    ) -> Result<Value, DocumentClientError> {
        let args: HardDeleteArgs = serde_json::from_value(args)
            .map_err(|e| DocumentClientError::InvalidInput(e.to_string()))?;

        let matches = scope
            .find("resourceId", &Value::String(args.resource_id.clone()))
            .await?;

        let mut removed = Vec::with_capacity(matches.len());
        for stored in matches {
            let document: ResourceDocument = serde_json::from_value(stored.body)
                .map_err(|e| DocumentClientError::Internal(format!("corrupt document: {e}")))?;
            if document.resource_type() != args.resource_type {
                continue;
            }

            scope.delete(document.id()).await?;
            removed.push((document.version_number(), document.version().to_string()));
        }

        removed.sort();
        let versions: Vec<String> = removed.into_iter().map(|(_, version)| version).collect();
        serde_json::to_value(versions).map_err(|e| DocumentClientError::Internal(e.to_string()))
    }
}

/// Client-side entry point for hard deletes.
#[derive(Debug, Clone)]
pub struct HardDeleteProcedure {
    client: Arc<dyn DocumentClient>,
    collection: String,
}

impl HardDeleteProcedure {
    /// Creates a procedure bound to `collection`.
    pub fn new(client: Arc<dyn DocumentClient>, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Removes every stored version of `resource_type/logical_id`.
    ///
    /// Returns the removed version ids. Deleting an absent resource returns
    /// an empty list.
    pub async fn execute(
        &self,
        logical_id: &str,
        resource_type: &str,
        cancel: &CancellationSignal,
    ) -> StoreResult<Vec<String>> {
        if logical_id.is_empty() {
            return Err(StoreError::missing_field("resourceId"));
        }
        if !ResourceDocument::is_valid_logical_id(logical_id) {
            return Err(StoreError::invalid_argument(
                "resourceId",
                format!("'{logical_id}' is not a valid logical id"),
            ));
        }
        if resource_type.is_empty() {
            return Err(StoreError::missing_field("resourceTypeName"));
        }

        let args = serde_json::to_value(HardDeleteArgs {
            resource_type: resource_type.to_string(),
            resource_id: logical_id.to_string(),
        })?;
        let partition_key = ResourceDocument::partition_key_for(resource_type);

        let value = cancel
            .run(async {
                self.client
                    .execute_procedure(&self.collection, &partition_key, &HardDeleteResource, args)
                    .await
                    .map_err(StoreError::from_client)
            })
            .await?;

        let removed: Vec<String> = serde_json::from_value(value)?;
        tracing::debug!(
            resource_type,
            id = logical_id,
            removed = removed.len(),
            "hard deleted resource"
        );
        Ok(removed)
    }
}
