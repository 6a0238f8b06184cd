//! Integration tests for permanent resource removal.

mod common;

use helios_docdb::cancel::CancellationSignal;
use helios_docdb::client::DocumentClientError;
use helios_docdb::error::StoreError;

use common::{COLLECTION, create_patient, create_resource, create_store};

#[tokio::test]
async fn test_removes_current_and_history_versions() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();
    store
        .upsert(create_patient("p1", "Jones"), Some("1"), false, true, &cancel)
        .await
        .unwrap();
    store
        .upsert(create_patient("p1", "Brown"), Some("2"), false, true, &cancel)
        .await
        .unwrap();
    assert_eq!(client.document_count(COLLECTION).await, 3);

    let removed = store.hard_delete("Patient", "p1", &cancel).await.unwrap();

    assert_eq!(removed, vec!["1", "2", "3"]);
    assert!(store.read("Patient", "p1", &cancel).await.unwrap().is_none());
    assert!(
        store
            .read_version("Patient", "p1", "1", &cancel)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(client.document_count(COLLECTION).await, 0);
}

#[tokio::test]
async fn test_second_delete_returns_empty_list() {
    let (_client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();

    assert_eq!(
        store.hard_delete("Patient", "p1", &cancel).await.unwrap(),
        vec!["1"]
    );
    assert!(
        store
            .hard_delete("Patient", "p1", &cancel)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_never_written_resource_returns_empty_list() {
    let (_client, store) = create_store();

    let removed = store
        .hard_delete("Patient", "ghost", &CancellationSignal::new())
        .await
        .unwrap();

    assert!(removed.is_empty());
}

#[tokio::test]
async fn test_other_resources_are_untouched() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();
    store
        .upsert(create_patient("p2", "Jones"), None, true, true, &cancel)
        .await
        .unwrap();
    store
        .upsert(create_resource("Observation", "p1", "bp"), None, true, true, &cancel)
        .await
        .unwrap();

    store.hard_delete("Patient", "p1", &cancel).await.unwrap();

    assert!(store.read("Patient", "p2", &cancel).await.unwrap().is_some());
    assert!(store.read("Observation", "p1", &cancel).await.unwrap().is_some());
    assert_eq!(client.document_count(COLLECTION).await, 2);
}

#[tokio::test]
async fn test_failed_delete_removes_nothing() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();
    client.fail_next(DocumentClientError::Throttled { retry_after: None });

    let result = store.hard_delete("Patient", "p1", &cancel).await;

    assert!(matches!(result, Err(StoreError::Retryable(_))));
    assert!(store.read("Patient", "p1", &cancel).await.unwrap().is_some());
}

#[tokio::test]
async fn test_empty_identity_is_rejected() {
    let (_client, store) = create_store();

    let result = store
        .hard_delete("Patient", "", &CancellationSignal::new())
        .await;

    assert!(matches!(result, Err(StoreError::Validation(_))));
}
