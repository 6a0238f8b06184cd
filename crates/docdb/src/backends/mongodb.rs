//! MongoDB binding.
//!
//! Documents live in one MongoDB collection per adapter collection. Each is
//! stored with a composite `_id` of partition key and document id, the
//! partition key under the configured partition field (`partition_key_path`
//! without its leading `/`) and an adapter-maintained `_etag` that changes on
//! every write. Conditional writes are filtered on `_etag`.
//!
//! Stored procedures run inside a multi-document transaction, which requires
//! a replica set or sharded cluster. Query text is a MongoDB filter in
//! extended JSON; each parameter `@name` adds an equality condition on the
//! field `name`. Continuation tokens are skip offsets.
//!
//! The configured [`ConsistencyLevel`] selects the read and write concerns
//! of the client and whether procedure sessions are causally consistent.
//! See [`consistency_settings`].

use async_trait::async_trait;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{Acknowledgment, ClientOptions, ReadConcern, WriteConcern};
use mongodb::{Client, ClientSession, Collection};
use serde_json::Value;
use uuid::Uuid;

use crate::client::{
    DocumentClient, DocumentClientError, FeedRequest, FeedResponse, PartitionScope,
    StoredDocument, StoredProcedure, WriteCondition, document_id,
};
use crate::config::{ConsistencyLevel, DocumentStoreConfig};
use crate::error::{StoreError, StoreResult, ValidationError};

const DUPLICATE_KEY: i32 = 11000;
const WRITE_CONFLICT: i32 = 112;
const MAX_TIME_EXPIRED: i32 = 50;
const REQUEST_RATE_TOO_LARGE: i32 = 16500;

/// Partition field used when none is configured.
pub const DEFAULT_PARTITION_FIELD: &str = "partitionKey";

/// Driver settings for one [`ConsistencyLevel`].
#[derive(Debug, Clone)]
pub struct ConsistencySettings {
    /// Read concern applied to every read.
    pub read_concern: ReadConcern,
    /// Write concern applied to every write.
    pub write_concern: WriteConcern,
    /// Whether procedure sessions are causally consistent.
    pub causal_consistency: bool,
}

/// Maps a consistency level onto MongoDB read and write concerns.
///
/// | Level | Read concern | Write concern | Causal sessions |
/// |---|---|---|---|
/// | `Strong` | majority | majority | yes |
/// | `BoundedStaleness` | majority | majority | no |
/// | `Session` | majority | majority | yes |
/// | `ConsistentPrefix` | local | majority | no |
/// | `Eventual` | local | 1 node | no |
///
/// Linearizable reads are not allowed inside transactions, so `Strong` uses
/// majority reads on causally consistent sessions.
pub fn consistency_settings(level: ConsistencyLevel) -> ConsistencySettings {
    let majority = WriteConcern::builder().w(Acknowledgment::Majority).build();
    let (read_concern, write_concern, causal_consistency) = match level {
        ConsistencyLevel::Strong | ConsistencyLevel::Session => {
            (ReadConcern::majority(), majority, true)
        }
        ConsistencyLevel::BoundedStaleness => (ReadConcern::majority(), majority, false),
        ConsistencyLevel::ConsistentPrefix => (ReadConcern::local(), majority, false),
        ConsistencyLevel::Eventual => (
            ReadConcern::local(),
            WriteConcern::builder().w(Acknowledgment::Nodes(1)).build(),
            false,
        ),
    };

    ConsistencySettings {
        read_concern,
        write_concern,
        causal_consistency,
    }
}

/// Top-level field named by a partition key path such as `/partitionKey`.
pub fn partition_field(path: &str) -> StoreResult<String> {
    let field = path.strip_prefix('/').unwrap_or_default();
    if field.is_empty() || field.contains('/') || field.starts_with('_') || field.contains('.') {
        return Err(invalid_config(format!(
            "partition_key_path '{path}' must name one top-level field"
        )));
    }
    Ok(field.to_string())
}

fn invalid_config(message: String) -> StoreError {
    StoreError::Validation(ValidationError::InvalidConfiguration { message })
}

/// [`DocumentClient`] over a MongoDB deployment.
#[derive(Debug, Clone)]
pub struct MongoDocumentClient {
    client: Client,
    database: String,
    partition_field: String,
    causal_consistency: bool,
}

impl MongoDocumentClient {
    /// Wraps an existing driver client, using the default partition field
    /// and the driver's session defaults.
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            partition_field: DEFAULT_PARTITION_FIELD.to_string(),
            causal_consistency: false,
        }
    }

    /// Connects using the configured host, which must be a MongoDB URI.
    ///
    /// A non-empty `key` is used as the password of the user named in the
    /// connection string.
    pub async fn connect(config: &DocumentStoreConfig) -> StoreResult<Self> {
        config.validate()?;

        let host = config.effective_host();
        if !host.starts_with("mongodb://") && !host.starts_with("mongodb+srv://") {
            return Err(invalid_config(format!(
                "host '{host}' is not a MongoDB connection string"
            )));
        }
        let partition_field = partition_field(&config.partition_key_path)?;

        let mut options = ClientOptions::parse(host)
            .await
            .map_err(|e| StoreError::from_client(map_mongo_error(e)))?;
        apply_key(&mut options, &config.key)?;

        let settings = consistency_settings(config.consistency_level);
        options.read_concern = Some(settings.read_concern);
        options.write_concern = Some(settings.write_concern);

        let client = Client::with_options(options)
            .map_err(|e| StoreError::from_client(map_mongo_error(e)))?;

        tracing::info!(
            database = %config.database,
            consistency = %config.consistency_level,
            partition_field = %partition_field,
            "connected to MongoDB"
        );
        Ok(Self {
            client,
            database: config.database.clone(),
            partition_field,
            causal_consistency: settings.causal_consistency,
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.database).collection(name)
    }

    async fn exists(
        &self,
        collection: &Collection<Document>,
        partition_key: &str,
        id: &str,
    ) -> Result<bool, DocumentClientError> {
        let found = collection
            .find_one(doc! { "_id": composite_id(partition_key, id) })
            .await
            .map_err(map_mongo_error)?;
        Ok(found.is_some())
    }
}

fn apply_key(options: &mut ClientOptions, key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Ok(());
    }
    match options.credential.as_mut() {
        Some(credential) if credential.username.is_some() => {
            credential.password = Some(key.to_string());
            Ok(())
        }
        _ => Err(invalid_config(
            "key requires a user name in the host connection string".to_string(),
        )),
    }
}

fn composite_id(partition_key: &str, id: &str) -> Document {
    doc! { "p": partition_key, "i": id }
}

fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

fn json_to_bson(value: &Value) -> Result<Bson, DocumentClientError> {
    Bson::try_from(value.clone()).map_err(|e| DocumentClientError::InvalidInput(e.to_string()))
}

fn to_stored_form(
    partition_field: &str,
    partition_key: &str,
    body: &Value,
    etag: &str,
) -> Result<Document, DocumentClientError> {
    let id = document_id(body)?;
    let mut document =
        bson::to_document(body).map_err(|e| DocumentClientError::InvalidInput(e.to_string()))?;

    match document.get(partition_field) {
        None => {
            document.insert(partition_field, partition_key);
        }
        Some(Bson::String(value)) if value == partition_key => {}
        Some(other) => {
            return Err(DocumentClientError::InvalidInput(format!(
                "document {partition_field} {other} does not match partition '{partition_key}'"
            )));
        }
    }

    document.insert("_id", composite_id(partition_key, id));
    document.insert("_etag", etag);
    Ok(document)
}

fn from_stored_form(mut document: Document) -> StoredDocument {
    let etag = document
        .get_str("_etag")
        .map(str::to_string)
        .unwrap_or_default();
    document.remove("_id");
    document.remove("_etag");

    StoredDocument {
        body: Bson::Document(document).into_relaxed_extjson(),
        etag,
    }
}

fn query_filter(
    partition_field: &str,
    request: &FeedRequest,
) -> Result<Document, DocumentClientError> {
    let mut filter = if request.query.text.trim().is_empty() {
        Document::new()
    } else {
        let parsed: Value = serde_json::from_str(&request.query.text)
            .map_err(|e| DocumentClientError::InvalidInput(format!("query filter: {e}")))?;
        match json_to_bson(&parsed)? {
            Bson::Document(document) => document,
            _ => {
                return Err(DocumentClientError::InvalidInput(
                    "query filter must be an object".to_string(),
                ));
            }
        }
    };

    for parameter in &request.query.parameters {
        let field = parameter.name.trim_start_matches('@');
        filter.insert(field, json_to_bson(&parameter.value)?);
    }
    if let Some(partition_key) = &request.partition_key {
        filter.insert(partition_field, partition_key.as_str());
    }
    Ok(filter)
}

fn write_error_code(err: &MongoError) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => Some(write_error.code),
        ErrorKind::Command(command_error) => Some(command_error.code),
        _ => None,
    }
}

// Throttled responses carry the suggested delay in the message as "RetryAfterMs=<n>".
fn retry_after_from_message(message: &str) -> Option<std::time::Duration> {
    let start = message.find("RetryAfterMs=")? + "RetryAfterMs=".len();
    let digits: String = message[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok().map(std::time::Duration::from_millis)
}

/// Maps a driver error onto the store's status taxonomy.
pub fn map_mongo_error(err: MongoError) -> DocumentClientError {
    match write_error_code(&err) {
        Some(DUPLICATE_KEY) | Some(WRITE_CONFLICT) => return DocumentClientError::Conflict,
        Some(REQUEST_RATE_TOO_LARGE) => {
            return DocumentClientError::Throttled {
                retry_after: retry_after_from_message(&err.to_string()),
            };
        }
        Some(MAX_TIME_EXPIRED) => return DocumentClientError::Timeout,
        _ => {}
    }

    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => {
            DocumentClientError::Unavailable(err.to_string())
        }
        ErrorKind::InvalidArgument { .. } => DocumentClientError::InvalidInput(err.to_string()),
        _ => DocumentClientError::Internal(err.to_string()),
    }
}

#[async_trait]
impl DocumentClient for MongoDocumentClient {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn read_document(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, DocumentClientError> {
        let found = self
            .collection(collection)
            .find_one(doc! { "_id": composite_id(partition_key, id) })
            .await
            .map_err(map_mongo_error)?;
        Ok(found.map(from_stored_form))
    }

    async fn write_document(
        &self,
        collection: &str,
        partition_key: &str,
        document: Value,
        condition: WriteCondition,
    ) -> Result<StoredDocument, DocumentClientError> {
        let coll = self.collection(collection);
        let etag = new_etag();
        let stored_form = to_stored_form(&self.partition_field, partition_key, &document, &etag)?;
        let id = document_id(&document)?.to_string();

        match condition {
            WriteCondition::None => {
                coll.replace_one(doc! { "_id": composite_id(partition_key, &id) }, stored_form)
                    .upsert(true)
                    .await
                    .map_err(map_mongo_error)?;
            }
            WriteCondition::IfNoneMatch => {
                coll.insert_one(stored_form)
                    .await
                    .map_err(map_mongo_error)?;
            }
            WriteCondition::IfMatch(expected) => {
                let result = coll
                    .replace_one(
                        doc! { "_id": composite_id(partition_key, &id), "_etag": expected },
                        stored_form,
                    )
                    .await
                    .map_err(map_mongo_error)?;
                if result.matched_count == 0 {
                    return Err(if self.exists(&coll, partition_key, &id).await? {
                        DocumentClientError::PreconditionFailed
                    } else {
                        DocumentClientError::NotFound
                    });
                }
            }
        }

        Ok(StoredDocument {
            body: document,
            etag,
        })
    }

    async fn delete_document(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), DocumentClientError> {
        let coll = self.collection(collection);
        let mut filter = doc! { "_id": composite_id(partition_key, id) };
        if let Some(etag) = if_match {
            filter.insert("_etag", etag);
        }

        let result = coll.delete_one(filter).await.map_err(map_mongo_error)?;
        if result.deleted_count == 0 {
            return Err(
                if if_match.is_some() && self.exists(&coll, partition_key, id).await? {
                    DocumentClientError::PreconditionFailed
                } else {
                    DocumentClientError::NotFound
                },
            );
        }
        Ok(())
    }

    async fn query_documents(
        &self,
        collection: &str,
        request: &FeedRequest,
    ) -> Result<FeedResponse, DocumentClientError> {
        let coll = self.collection(collection);
        let filter = query_filter(&self.partition_field, request)?;
        let activity_id = Uuid::new_v4().to_string();

        if request.count_only {
            let count = coll
                .count_documents(filter)
                .await
                .map_err(map_mongo_error)?;
            return Ok(FeedResponse {
                items: vec![Value::from(count)],
                continuation: None,
                activity_id,
                request_charge: 0.0,
            });
        }

        let offset = match request.continuation.as_deref() {
            None | Some("") => 0u64,
            Some(token) => token.parse().map_err(|_| {
                DocumentClientError::InvalidInput(format!("malformed continuation '{token}'"))
            })?,
        };
        let page_size = u64::from(request.max_item_count.max(1));

        let mut sort = Document::new();
        sort.insert(self.partition_field.as_str(), 1);
        sort.insert("_id", 1);

        // One extra item tells us whether another page exists.
        let mut cursor = coll
            .find(filter)
            .sort(sort)
            .skip(offset)
            .limit(i64::try_from(page_size + 1).unwrap_or(i64::MAX))
            .await
            .map_err(map_mongo_error)?;

        let mut items = Vec::new();
        let mut has_more = false;
        while cursor.advance().await.map_err(map_mongo_error)? {
            if items.len() as u64 == page_size {
                has_more = true;
                break;
            }
            let document: Document = cursor.deserialize_current().map_err(map_mongo_error)?;
            items.push(from_stored_form(document).body);
        }

        let continuation = has_more.then(|| (offset + page_size).to_string());
        Ok(FeedResponse {
            items,
            continuation,
            activity_id,
            request_charge: 0.0,
        })
    }

    async fn execute_procedure(
        &self,
        collection: &str,
        partition_key: &str,
        procedure: &dyn StoredProcedure,
        args: Value,
    ) -> Result<Value, DocumentClientError> {
        let mut session = self
            .client
            .start_session()
            .causal_consistency(self.causal_consistency)
            .await
            .map_err(map_mongo_error)?;
        session.start_transaction().await.map_err(map_mongo_error)?;

        let result = {
            let mut scope = MongoScope {
                collection: self.collection(collection),
                session: &mut session,
                partition_field: &self.partition_field,
                partition_key: partition_key.to_string(),
            };
            procedure.execute(&mut scope, args).await
        };

        match result {
            Ok(value) => {
                session
                    .commit_transaction()
                    .await
                    .map_err(map_mongo_error)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!(
                        procedure = %procedure.full_name(),
                        error = %abort_err,
                        "failed to abort procedure transaction"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Transaction-bound view of one partition.
struct MongoScope<'a> {
    collection: Collection<Document>,
    session: &'a mut ClientSession,
    partition_field: &'a str,
    partition_key: String,
}

impl MongoScope<'_> {
    fn id_filter(&self, id: &str) -> Document {
        doc! { "_id": composite_id(&self.partition_key, id) }
    }
}

#[async_trait]
impl<'a> PartitionScope for MongoScope<'a> {
    fn partition_key(&self) -> &str {
        &self.partition_key
    }

    async fn read(&mut self, id: &str) -> Result<Option<StoredDocument>, DocumentClientError> {
        let found = self
            .collection
            .find_one(self.id_filter(id))
            .session(&mut *self.session)
            .await
            .map_err(map_mongo_error)?;
        Ok(found.map(from_stored_form))
    }

    async fn find(
        &mut self,
        field: &str,
        value: &Value,
    ) -> Result<Vec<StoredDocument>, DocumentClientError> {
        let mut filter = Document::new();
        filter.insert(self.partition_field, self.partition_key.as_str());
        filter.insert(field, json_to_bson(value)?);

        let mut cursor = self
            .collection
            .find(filter)
            .sort(doc! { "_id": 1 })
            .session(&mut *self.session)
            .await
            .map_err(map_mongo_error)?;

        let mut found = Vec::new();
        while cursor
            .advance(&mut *self.session)
            .await
            .map_err(map_mongo_error)?
        {
            let document: Document = cursor.deserialize_current().map_err(map_mongo_error)?;
            found.push(from_stored_form(document));
        }
        Ok(found)
    }

    async fn create(&mut self, document: Value) -> Result<StoredDocument, DocumentClientError> {
        let etag = new_etag();
        let stored_form =
            to_stored_form(self.partition_field, &self.partition_key, &document, &etag)?;
        self.collection
            .insert_one(stored_form)
            .session(&mut *self.session)
            .await
            .map_err(map_mongo_error)?;
        Ok(StoredDocument {
            body: document,
            etag,
        })
    }

    async fn replace(
        &mut self,
        document: Value,
        if_match: &str,
    ) -> Result<StoredDocument, DocumentClientError> {
        let etag = new_etag();
        let id = document_id(&document)?.to_string();
        let stored_form =
            to_stored_form(self.partition_field, &self.partition_key, &document, &etag)?;

        let mut filter = self.id_filter(&id);
        filter.insert("_etag", if_match);
        let result = self
            .collection
            .replace_one(filter, stored_form)
            .session(&mut *self.session)
            .await
            .map_err(map_mongo_error)?;

        if result.matched_count == 0 {
            return Err(DocumentClientError::PreconditionFailed);
        }
        Ok(StoredDocument {
            body: document,
            etag,
        })
    }

    async fn delete(&mut self, id: &str) -> Result<(), DocumentClientError> {
        let result = self
            .collection
            .delete_one(self.id_filter(id))
            .session(&mut *self.session)
            .await
            .map_err(map_mongo_error)?;
        if result.deleted_count == 0 {
            return Err(DocumentClientError::NotFound);
        }
        Ok(())
    }
}
