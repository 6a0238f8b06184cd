//! In-memory document store.
//!
//! [`InMemoryDocumentClient`] implements the full [`DocumentClient`] contract
//! inside the process. Procedures run against a staged copy of their
//! partition that is committed only when the procedure succeeds, and all
//! procedure executions are serialized, so atomicity holds the same way it
//! does on a real store.
//!
//! Queries do not interpret the query text. Every parameter `@name` is
//! matched for equality against the top-level field `name`; results are
//! ordered by partition key and document id, and continuation tokens are
//! plain offsets.
//!
//! For tests the client counts round trips and can be told to fail the next
//! calls with a given error.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::{
    DocumentClient, DocumentClientError, FeedRequest, FeedResponse, PartitionScope,
    StoredDocument, StoredProcedure, WriteCondition, document_id,
};

type Partition = BTreeMap<String, StoredDocument>;

// collection -> partition key -> partition
type Collections = HashMap<String, BTreeMap<String, Partition>>;

/// Process-local [`DocumentClient`].
#[derive(Debug, Default)]
pub struct InMemoryDocumentClient {
    collections: Mutex<Collections>,
    etag_counter: AtomicU64,
    round_trips: AtomicU64,
    injected_failures: parking_lot::Mutex<VecDeque<DocumentClientError>>,
}

impl InMemoryDocumentClient {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call fail with `err` instead of reaching the store.
    ///
    /// Queued failures are consumed in order, one per call.
    pub fn fail_next(&self, err: DocumentClientError) {
        self.injected_failures.lock().push_back(err);
    }

    /// Number of calls made against the store, failed ones included.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Number of documents stored in `collection`.
    pub async fn document_count(&self, collection: &str) -> usize {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .map(|partitions| partitions.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// Ids of the documents in one partition, in order.
    pub async fn document_ids(&self, collection: &str, partition_key: &str) -> Vec<String> {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .and_then(|partitions| partitions.get(partition_key))
            .map(|partition| partition.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn begin_call(&self) -> Result<(), DocumentClientError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        match self.injected_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_etag(&self) -> String {
        next_etag(&self.etag_counter)
    }
}

fn next_etag(counter: &AtomicU64) -> String {
    format!("\"{:08x}\"", counter.fetch_add(1, Ordering::SeqCst) + 1)
}

fn check_precondition(
    existing: Option<&StoredDocument>,
    condition: &WriteCondition,
) -> Result<(), DocumentClientError> {
    match (condition, existing) {
        (WriteCondition::None, _) => Ok(()),
        (WriteCondition::IfNoneMatch, None) => Ok(()),
        (WriteCondition::IfNoneMatch, Some(_)) => Err(DocumentClientError::Conflict),
        (WriteCondition::IfMatch(_), None) => Err(DocumentClientError::NotFound),
        (WriteCondition::IfMatch(etag), Some(stored)) if &stored.etag == etag => Ok(()),
        (WriteCondition::IfMatch(_), Some(_)) => Err(DocumentClientError::PreconditionFailed),
    }
}

fn matches_parameters(document: &Value, request: &FeedRequest) -> bool {
    request.query.parameters.iter().all(|parameter| {
        let field = parameter.name.trim_start_matches('@');
        document.get(field) == Some(&parameter.value)
    })
}

#[async_trait]
impl DocumentClient for InMemoryDocumentClient {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read_document(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, DocumentClientError> {
        self.begin_call()?;
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|partitions| partitions.get(partition_key))
            .and_then(|partition| partition.get(id))
            .cloned())
    }

    async fn write_document(
        &self,
        collection: &str,
        partition_key: &str,
        document: Value,
        condition: WriteCondition,
    ) -> Result<StoredDocument, DocumentClientError> {
        self.begin_call()?;
        let id = document_id(&document)?.to_string();

        let mut collections = self.collections.lock().await;
        let partition = collections
            .entry(collection.to_string())
            .or_default()
            .entry(partition_key.to_string())
            .or_default();

        check_precondition(partition.get(&id), &condition)?;

        let stored = StoredDocument {
            body: document,
            etag: self.next_etag(),
        };
        partition.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete_document(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), DocumentClientError> {
        self.begin_call()?;
        let mut collections = self.collections.lock().await;
        let partition = collections
            .get_mut(collection)
            .and_then(|partitions| partitions.get_mut(partition_key))
            .ok_or(DocumentClientError::NotFound)?;

        let stored = partition.get(id).ok_or(DocumentClientError::NotFound)?;
        if let Some(etag) = if_match {
            if stored.etag != etag {
                return Err(DocumentClientError::PreconditionFailed);
            }
        }

        partition.remove(id);
        Ok(())
    }

    async fn query_documents(
        &self,
        collection: &str,
        request: &FeedRequest,
    ) -> Result<FeedResponse, DocumentClientError> {
        self.begin_call()?;

        if request.partition_key.is_none() && !request.enable_cross_partition {
            return Err(DocumentClientError::InvalidInput(
                "cross-partition query requires enable_cross_partition".to_string(),
            ));
        }

        let offset = match request.continuation.as_deref() {
            None | Some("") => 0,
            Some(token) => token.parse::<usize>().map_err(|_| {
                DocumentClientError::InvalidInput(format!("malformed continuation '{token}'"))
            })?,
        };

        let collections = self.collections.lock().await;
        let matching: Vec<&Value> = collections
            .get(collection)
            .into_iter()
            .flat_map(|partitions| partitions.iter())
            .filter(|(key, _)| {
                request
                    .partition_key
                    .as_deref()
                    .is_none_or(|wanted| wanted == key.as_str())
            })
            .flat_map(|(_, partition)| partition.values())
            .map(|stored| &stored.body)
            .filter(|body| matches_parameters(body, request))
            .collect();

        let activity_id = uuid::Uuid::new_v4().to_string();

        if request.count_only {
            return Ok(FeedResponse {
                items: vec![Value::from(matching.len() as u64)],
                continuation: None,
                activity_id,
                request_charge: 1.0,
            });
        }

        let page_size = request.max_item_count.max(1) as usize;
        let items: Vec<Value> = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|body| (*body).clone())
            .collect();

        let next_offset = offset + items.len();
        let continuation = (next_offset < matching.len()).then(|| next_offset.to_string());

        Ok(FeedResponse {
            request_charge: items.len().max(1) as f64,
            items,
            continuation,
            activity_id,
        })
    }

    async fn execute_procedure(
        &self,
        collection: &str,
        partition_key: &str,
        procedure: &dyn StoredProcedure,
        args: Value,
    ) -> Result<Value, DocumentClientError> {
        self.begin_call()?;

        let mut collections = self.collections.lock().await;
        let staged = collections
            .get(collection)
            .and_then(|partitions| partitions.get(partition_key))
            .cloned()
            .unwrap_or_default();

        let mut scope = MemoryScope {
            partition_key: partition_key.to_string(),
            documents: staged,
            etag_counter: &self.etag_counter,
        };

        tracing::trace!(
            procedure = %procedure.full_name(),
            partition_key,
            "executing stored procedure"
        );
        let result = procedure.execute(&mut scope, args).await?;

        collections
            .entry(collection.to_string())
            .or_default()
            .insert(partition_key.to_string(), scope.documents);
        Ok(result)
    }
}

/// Staged view of one partition during a procedure.
struct MemoryScope<'a> {
    partition_key: String,
    documents: Partition,
    etag_counter: &'a AtomicU64,
}

#[async_trait]
impl<'a> PartitionScope for MemoryScope<'a> {
    fn partition_key(&self) -> &str {
        &self.partition_key
    }

    async fn read(&mut self, id: &str) -> Result<Option<StoredDocument>, DocumentClientError> {
        Ok(self.documents.get(id).cloned())
    }

    async fn find(
        &mut self,
        field: &str,
        value: &Value,
    ) -> Result<Vec<StoredDocument>, DocumentClientError> {
        Ok(self
            .documents
            .values()
            .filter(|stored| stored.body.get(field) == Some(value))
            .cloned()
            .collect())
    }

    async fn create(&mut self, document: Value) -> Result<StoredDocument, DocumentClientError> {
        let id = document_id(&document)?.to_string();
        check_precondition(self.documents.get(&id), &WriteCondition::IfNoneMatch)?;

        let stored = StoredDocument {
            body: document,
            etag: next_etag(self.etag_counter),
        };
        self.documents.insert(id, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &mut self,
        document: Value,
        if_match: &str,
    ) -> Result<StoredDocument, DocumentClientError> {
        let id = document_id(&document)?.to_string();
        check_precondition(
            self.documents.get(&id),
            &WriteCondition::IfMatch(if_match.to_string()),
        )?;

        let stored = StoredDocument {
            body: document,
            etag: next_etag(self.etag_counter),
        };
        self.documents.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&mut self, id: &str) -> Result<(), DocumentClientError> {
        self.documents
            .remove(id)
            .map(|_| ())
            .ok_or(DocumentClientError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::QuerySpec;

    const COLLECTION: &str = "fhir";

    fn feed(query: QuerySpec) -> FeedRequest {
        FeedRequest {
            query,
            partition_key: None,
            enable_cross_partition: true,
            max_item_count: 10,
            continuation: None,
            count_only: false,
        }
    }

    /// Writes a document then fails, to prove staged writes are discarded.
    #[derive(Debug)]
    struct WriteThenFail;

    #[async_trait]
    impl StoredProcedure for WriteThenFail {
        fn name(&self) -> &'static str {
            "writeThenFail"
        }

        fn version(&self) -> u32 {
            1
        }

        async fn execute(
            &self,
            scope: &mut dyn PartitionScope,
            _args: Value,
        ) -> Result<Value, DocumentClientError> {
            scope.create(json!({"id": "staged"})).await?;
            Err(DocumentClientError::Internal("abort".to_string()))
        }
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let client = InMemoryDocumentClient::new();
        let first = client
            .write_document(COLLECTION, "pk", json!({"id": "a"}), WriteCondition::IfNoneMatch)
            .await
            .unwrap();

        let again = client
            .write_document(COLLECTION, "pk", json!({"id": "a"}), WriteCondition::IfNoneMatch)
            .await;
        assert_eq!(again.unwrap_err(), DocumentClientError::Conflict);

        let stale = client
            .write_document(
                COLLECTION,
                "pk",
                json!({"id": "a", "v": 2}),
                WriteCondition::IfMatch("\"bogus\"".to_string()),
            )
            .await;
        assert_eq!(stale.unwrap_err(), DocumentClientError::PreconditionFailed);

        let replaced = client
            .write_document(
                COLLECTION,
                "pk",
                json!({"id": "a", "v": 2}),
                WriteCondition::IfMatch(first.etag.clone()),
            )
            .await
            .unwrap();
        assert_ne!(replaced.etag, first.etag);
    }

    #[tokio::test]
    async fn test_failed_procedure_commits_nothing() {
        let client = InMemoryDocumentClient::new();
        let result = client
            .execute_procedure(COLLECTION, "pk", &WriteThenFail, Value::Null)
            .await;

        assert!(result.is_err());
        assert_eq!(client.document_count(COLLECTION).await, 0);
    }

    #[tokio::test]
    async fn test_fault_injection_counts_round_trip() {
        let client = InMemoryDocumentClient::new();
        client.fail_next(DocumentClientError::Throttled { retry_after: None });

        let result = client.read_document(COLLECTION, "pk", "a").await;
        assert!(matches!(result, Err(DocumentClientError::Throttled { .. })));
        assert!(client.read_document(COLLECTION, "pk", "a").await.unwrap().is_none());
        assert_eq!(client.round_trips(), 2);
    }

    #[tokio::test]
    async fn test_query_pages_with_offset_continuation() {
        let client = InMemoryDocumentClient::new();
        for id in ["a", "b", "c"] {
            client
                .write_document(
                    COLLECTION,
                    "Patient",
                    json!({"id": id, "kind": "x"}),
                    WriteCondition::None,
                )
                .await
                .unwrap();
        }

        let mut request = feed(QuerySpec::new("SELECT * FROM root r").with_parameter("@kind", "x"));
        request.max_item_count = 2;

        let first = client.query_documents(COLLECTION, &request).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.continuation.as_deref(), Some("2"));

        request.continuation = first.continuation;
        let second = client.query_documents(COLLECTION, &request).await.unwrap();
        assert_eq!(second.items, vec![json!({"id": "c", "kind": "x"})]);
        assert_eq!(second.continuation, None);
    }
}
