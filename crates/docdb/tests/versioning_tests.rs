//! Integration tests for versioned upserts and history retention.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use helios_docdb::cancel::CancellationSignal;
use helios_docdb::client::{DocumentClient, DocumentClientError, WriteCondition};
use helios_docdb::error::{ConcurrencyError, ResourceError, RetryableError, StoreError};
use helios_docdb::types::{ResourceDocument, UpsertOutcome};

use common::{COLLECTION, create_patient, create_store};

// ============================================================================
// Create / Update Tests
// ============================================================================

#[tokio::test]
async fn test_create_update_and_stale_update() {
    let (_client, store) = create_store();
    let cancel = CancellationSignal::new();

    let created = store
        .upsert(create_patient("p1", "Smith"), None, true, false, &cancel)
        .await
        .unwrap();
    assert_eq!(created.outcome, UpsertOutcome::Created);
    assert_eq!(created.version_id(), "1");

    let updated = store
        .upsert(create_patient("p1", "Jones"), Some("1"), true, true, &cancel)
        .await
        .unwrap();
    assert_eq!(updated.outcome, UpsertOutcome::Updated);
    assert_eq!(updated.version_id(), "2");

    let history = store
        .read_version("Patient", "p1", "1", &cancel)
        .await
        .unwrap()
        .expect("version 1 retained");
    assert!(history.is_history());
    assert_eq!(history.version(), "1");
    assert!(history.raw_resource().data.contains("Smith"));

    let stale = store
        .upsert(create_patient("p1", "Brown"), Some("1"), true, true, &cancel)
        .await;
    match stale {
        Err(StoreError::Concurrency(ConcurrencyError::VersionConflict {
            resource_type,
            id,
            expected_version,
        })) => {
            assert_eq!(resource_type, "Patient");
            assert_eq!(id, "p1");
            assert_eq!(expected_version.as_deref(), Some("1"));
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    let current = store.read("Patient", "p1", &cancel).await.unwrap().unwrap();
    assert_eq!(current.version(), "2");
    assert!(current.raw_resource().data.contains("Jones"));
}

#[tokio::test]
async fn test_read_version_returns_current_version() {
    let (_client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();

    let current = store
        .read_version("Patient", "p1", "1", &cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(!current.is_history());
}

#[tokio::test]
async fn test_update_without_history_drops_prior_version() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, false, &cancel)
        .await
        .unwrap();
    store
        .upsert(create_patient("p1", "Jones"), Some("1"), true, false, &cancel)
        .await
        .unwrap();

    assert!(
        store
            .read_version("Patient", "p1", "1", &cancel)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(client.document_count(COLLECTION).await, 1);
}

#[tokio::test]
async fn test_update_only_on_missing_resource_is_not_found() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    let result = store
        .upsert(create_patient("ghost", "Nobody"), None, false, true, &cancel)
        .await;

    assert!(matches!(
        result,
        Err(StoreError::Resource(ResourceError::NotFound { .. }))
    ));
    assert_eq!(client.document_count(COLLECTION).await, 0);
}

#[tokio::test]
async fn test_match_version_on_missing_resource_is_conflict() {
    let (_client, store) = create_store();
    let cancel = CancellationSignal::new();

    let result = store
        .upsert(create_patient("ghost", "Nobody"), Some("3"), true, true, &cancel)
        .await;

    assert!(matches!(
        result,
        Err(StoreError::Concurrency(ConcurrencyError::VersionConflict { .. }))
    ));
}

#[tokio::test]
async fn test_missing_identity_is_rejected_before_store_call() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    let result = store
        .upsert(create_patient("", "Nobody"), None, true, true, &cancel)
        .await;

    assert!(matches!(result, Err(StoreError::Validation(_))));
    assert_eq!(client.round_trips(), 0);
}

#[tokio::test]
async fn test_id_with_history_separator_is_rejected() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("a", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();
    store
        .upsert(create_patient("a", "Jones"), Some("1"), false, true, &cancel)
        .await
        .unwrap();
    let round_trips = client.round_trips();

    for keep_history in [false, true] {
        let result = store
            .upsert(create_patient("a_1", "Brown"), None, true, keep_history, &cancel)
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }
    assert!(matches!(
        store.hard_delete("Patient", "a_1", &cancel).await,
        Err(StoreError::Validation(_))
    ));
    assert_eq!(client.round_trips(), round_trips);

    let history = store
        .read_version("Patient", "a", "1", &cancel)
        .await
        .unwrap()
        .expect("history record kept");
    assert_eq!(history.resource_id(), "a");
    assert!(history.is_history());
    assert!(store.read("Patient", "a_1", &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_foreign_record_at_resource_id_is_not_superseded() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("c", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();
    store
        .upsert(create_patient("c", "Jones"), Some("1"), false, true, &cancel)
        .await
        .unwrap();

    // Plant a copy of c's history record under the id "b".
    let stored = client
        .read_document(COLLECTION, "Patient", "c_1")
        .await
        .unwrap()
        .expect("history record");
    let mut body = stored.body;
    body["id"] = "b".into();
    client
        .write_document(COLLECTION, "Patient", body, WriteCondition::IfNoneMatch)
        .await
        .unwrap();

    assert!(store.read("Patient", "b", &cancel).await.unwrap().is_none());
    assert!(
        store
            .read_version("Patient", "b", "1", &cancel)
            .await
            .unwrap()
            .is_none()
    );

    let result = store
        .upsert(create_patient("b", "Brown"), None, true, false, &cancel)
        .await;
    assert!(matches!(
        result,
        Err(StoreError::Fatal(DocumentClientError::InvalidInput(_)))
    ));

    let planted = client
        .read_document(COLLECTION, "Patient", "b")
        .await
        .unwrap()
        .expect("planted record untouched");
    assert_eq!(planted.body["resourceId"], "c");
    assert_eq!(planted.body["isHistory"], true);
}

// ============================================================================
// Soft Delete Tests
// ============================================================================

#[tokio::test]
async fn test_soft_delete_records_version_once() {
    let (_client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();

    let deleted = store
        .upsert(ResourceDocument::deleted("Patient", "p1"), None, false, true, &cancel)
        .await
        .unwrap();
    assert_eq!(deleted.outcome, UpsertOutcome::Updated);
    assert_eq!(deleted.version_id(), "2");
    assert!(deleted.document.is_deleted());

    let again = store
        .upsert(ResourceDocument::deleted("Patient", "p1"), None, false, true, &cancel)
        .await
        .unwrap();
    assert_eq!(again.outcome, UpsertOutcome::Updated);
    assert_eq!(again.version_id(), "2");

    let current = store.read("Patient", "p1", &cancel).await.unwrap().unwrap();
    assert!(current.is_deleted());
    assert!(
        store
            .read_version("Patient", "p1", "1", &cancel)
            .await
            .unwrap()
            .is_some()
    );
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_matched_updates_have_single_winner() {
    let (_client, store) = create_store();
    let cancel = CancellationSignal::new();

    store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            store
                .upsert(
                    create_patient("p1", &format!("Writer{i}")),
                    Some("1"),
                    false,
                    true,
                    &cancel,
                )
                .await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result.version_id(), "2");
                winners += 1;
            }
            Err(StoreError::Concurrency(ConcurrencyError::VersionConflict { .. })) => {
                conflicts += 1
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(conflicts, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unconditional_upserts_are_linearized() {
    let (_client, store) = create_store();
    let cancel = CancellationSignal::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            store
                .upsert(
                    create_patient("p1", &format!("Writer{i}")),
                    None,
                    true,
                    true,
                    &cancel,
                )
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut versions = HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap();
        if result.outcome == UpsertOutcome::Created {
            created += 1;
        }
        versions.insert(result.version_id().to_string());
    }

    assert_eq!(created, 1);
    assert_eq!(versions.len(), 8);
    let current = store.read("Patient", "p1", &cancel).await.unwrap().unwrap();
    assert_eq!(current.version(), "8");
}

#[tokio::test]
async fn test_store_create_conflict_is_version_conflict() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    client.fail_next(DocumentClientError::Conflict);
    let result = store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await;

    assert!(matches!(
        result,
        Err(StoreError::Concurrency(ConcurrencyError::VersionConflict {
            expected_version: None,
            ..
        }))
    ));
}

// ============================================================================
// Failure Classification Tests
// ============================================================================

#[tokio::test]
async fn test_throttled_upsert_surfaces_retry_after() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    client.fail_next(DocumentClientError::Throttled {
        retry_after: Some(Duration::from_millis(500)),
    });
    let result = store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await;

    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_millis(500)));
    assert_eq!(client.document_count(COLLECTION).await, 0);
    assert_eq!(client.round_trips(), 1);
}

#[tokio::test]
async fn test_unavailable_upsert_is_retryable() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    client.fail_next(DocumentClientError::Unavailable("failover".to_string()));
    let result = store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await;

    assert!(matches!(
        result,
        Err(StoreError::Retryable(RetryableError::Unavailable))
    ));
}

#[tokio::test]
async fn test_unknown_store_failure_is_fatal_and_unchanged() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();

    client.fail_next(DocumentClientError::Internal("disk full".to_string()));
    let result = store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await;

    match result {
        Err(StoreError::Fatal(DocumentClientError::Internal(message))) => {
            assert_eq!(message, "disk full")
        }
        other => panic!("expected fatal error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancelled_upsert_writes_nothing() {
    let (client, store) = create_store();
    let cancel = CancellationSignal::new();
    cancel.cancel();

    let result = store
        .upsert(create_patient("p1", "Smith"), None, true, true, &cancel)
        .await;

    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert_eq!(client.round_trips(), 0);
    assert_eq!(client.document_count(COLLECTION).await, 0);
}
