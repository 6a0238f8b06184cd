//! Versioned resource documents.
//!
//! A logical resource is stored as one *current* document, addressed by the
//! resource id, plus zero or more immutable *history* documents addressed by
//! `{id}_{version}`. All documents of a resource type share one partition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted logical id.
pub const MAX_LOGICAL_ID_LEN: usize = 64;

/// Serialization format of a raw resource body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RawResourceFormat {
    /// JSON text.
    #[default]
    Json,
    /// XML text.
    Xml,
}

/// Opaque serialized resource body.
///
/// The adapter never looks inside `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResource {
    /// Serialized resource.
    pub data: String,
    /// Serialization format.
    #[serde(default)]
    pub format: RawResourceFormat,
}

impl RawResource {
    /// Wraps a JSON body.
    pub fn json(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            format: RawResourceFormat::Json,
        }
    }
}

/// Identity of a resource, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Resource type (e.g. "Patient").
    pub resource_type: String,
    /// Logical id.
    pub id: String,
    /// Version id, when addressing a specific version.
    pub version_id: Option<String>,
}

impl ResourceKey {
    /// Creates a key for the current version of a resource.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: None,
        }
    }

    /// Creates a key pinned to a version.
    pub fn with_version(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: Some(version_id.into()),
        }
    }

    /// Partition holding every document of this resource.
    pub fn partition_key(&self) -> String {
        ResourceDocument::partition_key_for(&self.resource_type)
    }

    /// Store id of the history document for `version_id`.
    pub fn history_document_id(&self, version_id: &str) -> String {
        ResourceDocument::history_id(&self.id, version_id)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version_id {
            Some(version) => write!(f, "{}/{}/_history/{}", self.resource_type, self.id, version),
            None => write!(f, "{}/{}", self.resource_type, self.id),
        }
    }
}

/// A persisted resource record.
///
/// The required fields are typed; the resource body itself stays an opaque
/// [`RawResource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDocument {
    /// Store document id: the logical id, or `{id}_{version}` for history.
    id: String,

    /// Resource type.
    #[serde(rename = "resourceTypeName")]
    resource_type: String,

    /// Logical id shared by the current and all history documents.
    resource_id: String,

    /// Version id, assigned by the upsert procedure. Empty before the first write.
    #[serde(default)]
    version: String,

    /// Partition key, derived from the resource type.
    partition_key: String,

    /// Whether this is a retained prior version.
    #[serde(default)]
    is_history: bool,

    /// Soft-delete marker.
    #[serde(default)]
    is_deleted: bool,

    /// Time of the write that produced this version.
    last_modified: DateTime<Utc>,

    /// Serialized resource body.
    raw_resource: RawResource,
}

impl ResourceDocument {
    /// Creates an unversioned document ready to be upserted.
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        raw_resource: RawResource,
    ) -> Self {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        Self {
            id: resource_id.clone(),
            partition_key: Self::partition_key_for(&resource_type),
            resource_type,
            resource_id,
            version: String::new(),
            is_history: false,
            is_deleted: false,
            last_modified: Utc::now(),
            raw_resource,
        }
    }

    /// Creates a soft-delete marker for a resource.
    pub fn deleted(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        let mut document = Self::new(resource_type, resource_id, RawResource::json(""));
        document.is_deleted = true;
        document
    }

    /// Partition key for a resource type.
    pub fn partition_key_for(resource_type: &str) -> String {
        resource_type.to_string()
    }

    /// Whether `id` is a valid logical id: 1 to 64 of `A-Z a-z 0-9 - .`.
    ///
    /// History records append `_{version}` to the logical id, so `_` must
    /// stay out of logical ids for the two id spaces to remain disjoint.
    pub fn is_valid_logical_id(id: &str) -> bool {
        (1..=MAX_LOGICAL_ID_LEN).contains(&id.len())
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
    }

    /// Store id of the history document for a version.
    pub fn history_id(resource_id: &str, version: &str) -> String {
        format!("{}_{}", resource_id, version)
    }

    /// Store document id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Logical id.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Version id; empty before the first write.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Partition key.
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Whether this is a retained prior version.
    pub fn is_history(&self) -> bool {
        self.is_history
    }

    /// Whether this version marks the resource deleted.
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// Time of the write that produced this version.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Serialized resource body.
    pub fn raw_resource(&self) -> &RawResource {
        &self.raw_resource
    }

    /// Resource key of this document, pinned to its version when it has one.
    pub fn key(&self) -> ResourceKey {
        if self.version.is_empty() {
            ResourceKey::new(&self.resource_type, &self.resource_id)
        } else {
            ResourceKey::with_version(&self.resource_type, &self.resource_id, &self.version)
        }
    }

    /// Numeric value of the version id, if it is numeric.
    pub fn version_number(&self) -> Option<u64> {
        self.version.parse().ok()
    }

    /// Returns this document as the current version `version`.
    pub(crate) fn into_current(mut self, version: String, last_modified: DateTime<Utc>) -> Self {
        self.id = self.resource_id.clone();
        self.version = version;
        self.is_history = false;
        self.last_modified = last_modified;
        self
    }

    /// Returns this document as an immutable history record.
    pub(crate) fn into_history(mut self) -> Self {
        self.id = Self::history_id(&self.resource_id, &self.version);
        self.is_history = true;
        self
    }

    /// Whether this is the current version of `resource_id`.
    pub(crate) fn is_current_of(&self, resource_id: &str) -> bool {
        !self.is_history && self.resource_id == resource_id && self.id == resource_id
    }

    /// Whether this is the retained `version` of `resource_id`.
    pub(crate) fn is_history_of(&self, resource_id: &str, version: &str) -> bool {
        self.is_history && self.resource_id == resource_id && self.version == version
    }

    /// Checks the fields the adapter relies on.
    pub(crate) fn validate(&self) -> crate::error::StoreResult<()> {
        use crate::error::StoreError;

        if self.resource_type.is_empty() {
            return Err(StoreError::missing_field("resourceTypeName"));
        }
        if self.resource_id.is_empty() {
            return Err(StoreError::missing_field("resourceId"));
        }
        if !Self::is_valid_logical_id(&self.resource_id) {
            return Err(StoreError::invalid_argument(
                "resourceId",
                format!("'{}' is not a valid logical id", self.resource_id),
            ));
        }
        if self.partition_key.is_empty() {
            return Err(StoreError::missing_field("partitionKey"));
        }
        Ok(())
    }
}

/// Whether an upsert created a resource or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    /// No prior version existed.
    Created,
    /// A prior version existed and was superseded.
    Updated,
}

/// Result of a versioned write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResult {
    /// Created or updated.
    #[serde(rename = "outcomeType")]
    pub outcome: UpsertOutcome,
    /// The document as stored, carrying its new version id.
    #[serde(rename = "wrapper")]
    pub document: ResourceDocument,
}

impl UpsertResult {
    /// Version id of the written document.
    pub fn version_id(&self) -> &str {
        self.document.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_shape() {
        let doc = ResourceDocument::new("Patient", "p1", RawResource::json("{}"));
        assert_eq!(doc.id(), "p1");
        assert_eq!(doc.resource_id(), "p1");
        assert_eq!(doc.partition_key(), "Patient");
        assert_eq!(doc.version(), "");
        assert!(!doc.is_history());
        assert!(!doc.is_deleted());
        assert_eq!(doc.key().to_string(), "Patient/p1");
    }

    #[test]
    fn test_history_transition() {
        let doc = ResourceDocument::new("Patient", "p1", RawResource::json("{}"))
            .into_current("3".to_string(), Utc::now());
        assert_eq!(doc.version_number(), Some(3));

        let history = doc.into_history();
        assert_eq!(history.id(), "p1_3");
        assert_eq!(history.resource_id(), "p1");
        assert!(history.is_history());
        assert_eq!(history.key().to_string(), "Patient/p1/_history/3");
    }

    #[test]
    fn test_serialized_field_names() {
        let doc = ResourceDocument::new("Observation", "o1", RawResource::json("{\"a\":1}"));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["resourceTypeName"], "Observation");
        assert_eq!(value["resourceId"], "o1");
        assert_eq!(value["partitionKey"], "Observation");
        assert_eq!(value["isHistory"], false);
        assert_eq!(value["rawResource"]["format"], "Json");
    }

    #[test]
    fn test_validate_requires_identity() {
        let doc = ResourceDocument::new("", "p1", RawResource::json("{}"));
        assert!(doc.validate().is_err());
        let doc = ResourceDocument::new("Patient", "", RawResource::json("{}"));
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_logical_id_charset() {
        assert!(ResourceDocument::is_valid_logical_id("a-1.B"));
        assert!(ResourceDocument::is_valid_logical_id(&"x".repeat(64)));
        assert!(!ResourceDocument::is_valid_logical_id(&"x".repeat(65)));
        assert!(!ResourceDocument::is_valid_logical_id("a_1"));
        assert!(!ResourceDocument::is_valid_logical_id("a/1"));
        assert!(!ResourceDocument::is_valid_logical_id(""));

        let doc = ResourceDocument::new("Patient", "a_1", RawResource::json("{}"));
        assert!(matches!(
            doc.validate(),
            Err(crate::error::StoreError::Validation(
                crate::error::ValidationError::InvalidArgument { .. }
            ))
        ));
    }

    #[test]
    fn test_current_and_history_identity() {
        let current = ResourceDocument::new("Patient", "a", RawResource::json("{}"))
            .into_current("1".to_string(), Utc::now());
        assert!(current.is_current_of("a"));
        assert!(!current.is_current_of("a_1"));

        let history = current.into_history();
        assert!(!history.is_current_of("a"));
        assert!(!history.is_current_of("a_1"));
        assert!(history.is_history_of("a", "1"));
        assert!(!history.is_history_of("a", "2"));
    }

    #[test]
    fn test_upsert_result_wire_names() {
        let result = UpsertResult {
            outcome: UpsertOutcome::Created,
            document: ResourceDocument::new("Patient", "p1", RawResource::json("{}"))
                .into_current("1".to_string(), Utc::now()),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["outcomeType"], "Created");
        assert_eq!(value["wrapper"]["version"], "1");
        assert_eq!(result.version_id(), "1");
    }
}
