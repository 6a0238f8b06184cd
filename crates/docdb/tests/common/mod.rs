//! Shared helpers for the document store integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use helios_docdb::backends::memory::InMemoryDocumentClient;
use helios_docdb::config::DocumentStoreConfig;
use helios_docdb::store::DocumentDataStore;
use helios_docdb::types::{QueryDescriptor, QuerySpec, RawResource, ResourceDocument};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Collection used by every test.
pub const COLLECTION: &str = "fhir";

/// Installs a test log subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Creates a data store over a fresh in-memory client.
pub fn create_store() -> (Arc<InMemoryDocumentClient>, DocumentDataStore) {
    init_tracing();
    let client = Arc::new(InMemoryDocumentClient::new());
    let config = DocumentStoreConfig {
        collection: COLLECTION.to_string(),
        ..Default::default()
    };
    let store = DocumentDataStore::new(client.clone(), &config).expect("valid config");
    (client, store)
}

/// Creates a patient document whose body records `family`.
pub fn create_patient(id: &str, family: &str) -> ResourceDocument {
    create_resource("Patient", id, family)
}

/// Creates a document of any type whose body records `label`.
pub fn create_resource(resource_type: &str, id: &str, label: &str) -> ResourceDocument {
    let body = json!({
        "resourceType": resource_type,
        "id": id,
        "name": [{ "family": label }]
    });
    ResourceDocument::new(resource_type, id, RawResource::json(body.to_string()))
}

/// Query for the current versions of one resource type.
pub fn current_versions_of(resource_type: &str) -> QueryDescriptor {
    QueryDescriptor::new(
        QuerySpec::new(
            "SELECT * FROM root r WHERE r.resourceTypeName = @resourceTypeName AND r.isHistory = @isHistory",
        )
        .with_parameter("@resourceTypeName", resource_type)
        .with_parameter("@isHistory", false),
    )
}
