//! Single-page query execution.
//!
//! [`QueryExecutor::execute`] makes exactly one store round trip per call.
//! Raw continuations never leave the executor: they are exchanged for opaque
//! cursor ids through the [`ContinuationTokenCache`], and a cursor is
//! superseded as soon as the page after it has been fetched.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::cancel::CancellationSignal;
use crate::client::{DocumentClient, FeedRequest, FeedResponse};
use crate::error::{SearchError, StoreError, StoreResult};
use crate::query::continuation::ContinuationTokenCache;
use crate::types::{PaginationState, QueryDescriptor, QueryPage, ResourceDocument};

/// Executes query descriptors against one collection.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    client: Arc<dyn DocumentClient>,
    cache: Arc<dyn ContinuationTokenCache>,
    collection: String,
}

impl QueryExecutor {
    /// Creates an executor for `collection`.
    pub fn new(
        client: Arc<dyn DocumentClient>,
        cache: Arc<dyn ContinuationTokenCache>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cache,
            collection: collection.into(),
        }
    }

    /// Returns the continuation cache backing this executor.
    pub fn cache(&self) -> &Arc<dyn ContinuationTokenCache> {
        &self.cache
    }

    /// Fetches one page.
    ///
    /// A cursor in `pagination` takes precedence over a raw continuation in
    /// the descriptor. An unknown or superseded cursor fails with
    /// [`SearchError::InvalidCursor`]; the query is never restarted from the
    /// first page in its place.
    pub async fn execute(
        &self,
        descriptor: &QueryDescriptor,
        pagination: &PaginationState,
        cancel: &CancellationSignal,
    ) -> StoreResult<QueryPage> {
        if descriptor.max_item_count == 0 {
            return Err(StoreError::invalid_argument(
                "max_item_count",
                "must be greater than zero",
            ));
        }

        let continuation = match &pagination.cursor {
            Some(cursor) => Some(self.cache.resolve(cursor).await?),
            None => descriptor.continuation.clone(),
        };

        let request = FeedRequest {
            query: descriptor.query.clone(),
            partition_key: descriptor.partition_key().map(str::to_string),
            enable_cross_partition: true,
            max_item_count: descriptor.max_item_count,
            continuation,
            count_only: descriptor.count_only,
        };

        let query_id = Uuid::new_v4();
        tracing::debug!(
            %query_id,
            collection = %self.collection,
            query = %request.query.text,
            continuation = request.continuation.as_deref().unwrap_or(""),
            max_item_count = request.max_item_count,
            count_only = request.count_only,
            "executing document query"
        );

        let response = cancel
            .run(async {
                self.client
                    .query_documents(&self.collection, &request)
                    .await
                    .map_err(StoreError::from_client)
            })
            .await
            .inspect_err(|err| {
                tracing::warn!(%query_id, error = %err, "document query failed");
            })?;

        tracing::debug!(
            %query_id,
            activity_id = %response.activity_id,
            request_charge = response.request_charge,
            continuation = response.continuation.as_deref().unwrap_or(""),
            count = response.items.len(),
            "document query returned"
        );

        if descriptor.count_only {
            let total = count_from(response)?;
            if let Some(cursor) = &pagination.cursor {
                self.cache.invalidate(cursor).await?;
            }
            return Ok(QueryPage {
                documents: Vec::new(),
                next_cursor: None,
                total_count: Some(total),
            });
        }

        let documents = response
            .items
            .into_iter()
            .map(|item| decode_item(item, descriptor.root_alias.as_deref()))
            .collect::<StoreResult<Vec<_>>>()?;

        let next_cursor = match response.continuation.filter(|token| !token.is_empty()) {
            Some(token) => Some(self.cache.save(&token).await?),
            None => None,
        };

        if let Some(cursor) = &pagination.cursor {
            self.cache.invalidate(cursor).await?;
        }

        Ok(QueryPage {
            documents,
            next_cursor,
            total_count: None,
        })
    }
}

fn count_from(response: FeedResponse) -> StoreResult<u64> {
    let mut items = response.items.into_iter();
    match (items.next(), items.next()) {
        (Some(item), None) => item.as_u64().ok_or_else(|| {
            unexpected(format!("count query returned a non-numeric item: {item}"))
        }),
        (None, _) => Err(unexpected("count query returned no items".to_string())),
        (Some(_), Some(_)) => Err(unexpected(
            "count query returned more than one item".to_string(),
        )),
    }
}

fn decode_item(item: Value, root_alias: Option<&str>) -> StoreResult<ResourceDocument> {
    let document = match root_alias {
        Some(alias) => match item {
            Value::Object(mut fields) => fields
                .remove(alias)
                .ok_or_else(|| unexpected(format!("result item has no '{alias}' property")))?,
            other => {
                return Err(unexpected(format!("result item is not an object: {other}")));
            }
        },
        None => item,
    };

    serde_json::from_value(document)
        .map_err(|err| unexpected(format!("result item is not a resource document: {err}")))
}

fn unexpected(message: String) -> StoreError {
    StoreError::Search(SearchError::UnexpectedResponse { message })
}
