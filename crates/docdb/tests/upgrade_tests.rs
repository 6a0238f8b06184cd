//! Integration tests for lock-gated collection upgrades.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use helios_docdb::backends::memory::InMemoryDocumentClient;
use helios_docdb::cancel::CancellationSignal;
use helios_docdb::client::{DocumentClient, WriteCondition};
use helios_docdb::config::UpgradeConfig;
use helios_docdb::error::{LockError, StoreError, StoreResult};
use helios_docdb::lock::{DistributedLockFactory, ManualClock};
use helios_docdb::upgrade::{CollectionUpdater, CollectionUpgradeManager};
use serde_json::json;

use common::{COLLECTION, init_tracing};

#[derive(Debug)]
struct RecordingUpdater {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    advance_clock: Option<(Arc<ManualClock>, Duration)>,
}

impl RecordingUpdater {
    fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            log,
            advance_clock: None,
        }
    }

    fn advancing(mut self, clock: Arc<ManualClock>, by: Duration) -> Self {
        self.advance_clock = Some((clock, by));
        self
    }
}

#[async_trait]
impl CollectionUpdater for RecordingUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(
        &self,
        client: &dyn DocumentClient,
        collection: &str,
        _cancel: &CancellationSignal,
    ) -> StoreResult<()> {
        client
            .write_document(
                collection,
                "__upgrades__",
                json!({ "id": self.name }),
                WriteCondition::None,
            )
            .await?;
        self.log.lock().unwrap().push(self.name.clone());
        if let Some((clock, by)) = &self.advance_clock {
            clock.advance(*by);
        }
        Ok(())
    }
}

fn upgrade_config() -> UpgradeConfig {
    UpgradeConfig {
        lock_id: "collection-upgrade".to_string(),
        lease: Duration::from_secs(60),
        acquire_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_secs(2),
    }
}

fn create_manager() -> (
    Arc<InMemoryDocumentClient>,
    Arc<ManualClock>,
    DistributedLockFactory,
    CollectionUpgradeManager,
) {
    init_tracing();
    let client = Arc::new(InMemoryDocumentClient::new());
    let clock = Arc::new(ManualClock::starting_now());
    let locks = DistributedLockFactory::new(client.clone(), COLLECTION).with_clock(clock.clone());
    let manager = CollectionUpgradeManager::new(client.clone(), COLLECTION, upgrade_config())
        .with_lock_factory(locks.clone());
    (client, clock, locks, manager)
}

#[tokio::test]
async fn test_runs_updaters_in_order_and_releases_lock() {
    let (client, _clock, locks, manager) = create_manager();
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = manager
        .with_updater(Arc::new(RecordingUpdater::new("add-index", log.clone())))
        .with_updater(Arc::new(RecordingUpdater::new("backfill", log.clone())));

    let applied = manager.run(&CancellationSignal::new()).await.unwrap();

    assert_eq!(applied, vec!["add-index", "backfill"]);
    assert_eq!(*log.lock().unwrap(), vec!["add-index", "backfill"]);
    assert_eq!(
        client.document_ids(COLLECTION, "__upgrades__").await,
        vec!["add-index", "backfill"]
    );

    locks
        .acquire("collection-upgrade", Duration::from_secs(5), &CancellationSignal::new())
        .await
        .expect("lock released after run");
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_when_lock_stays_held() {
    let (_client, _clock, locks, manager) = create_manager();
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = manager.with_updater(Arc::new(RecordingUpdater::new("add-index", log.clone())));

    let (_lock, _handle) = locks
        .acquire("collection-upgrade", Duration::from_secs(600), &CancellationSignal::new())
        .await
        .unwrap();

    let result = manager.run(&CancellationSignal::new()).await;

    assert!(matches!(
        result,
        Err(StoreError::Lock(LockError::AcquireTimeout { .. }))
    ));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_abandons_run_when_lease_lapses() {
    let (_client, clock, locks, manager) = create_manager();
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = manager
        .with_updater(Arc::new(
            RecordingUpdater::new("slow-step", log.clone())
                .advancing(clock.clone(), Duration::from_secs(61)),
        ))
        .with_updater(Arc::new(RecordingUpdater::new("never-runs", log.clone())));

    let result = manager.run(&CancellationSignal::new()).await;

    assert!(matches!(
        result,
        Err(StoreError::Lock(LockError::LeaseExpired { .. }))
    ));
    assert_eq!(*log.lock().unwrap(), vec!["slow-step"]);

    // Nobody took the lease over, so the manager still released it.
    locks
        .acquire("collection-upgrade", Duration::from_secs(5), &CancellationSignal::new())
        .await
        .expect("lock released after abandoned run");
}

#[tokio::test]
async fn test_cancelled_run_releases_lock() {
    let (_client, _clock, locks, manager) = create_manager();

    #[derive(Debug)]
    struct CancellingUpdater(CancellationSignal);

    #[async_trait]
    impl CollectionUpdater for CancellingUpdater {
        fn name(&self) -> &str {
            "cancelling"
        }

        async fn apply(
            &self,
            _client: &dyn DocumentClient,
            _collection: &str,
            cancel: &CancellationSignal,
        ) -> StoreResult<()> {
            self.0.cancel();
            cancel.sleep(Duration::from_secs(1)).await
        }
    }

    let cancel = CancellationSignal::new();
    let manager = manager.with_updater(Arc::new(CancellingUpdater(cancel.clone())));

    let result = manager.run(&cancel).await;

    assert!(matches!(result, Err(StoreError::Cancelled)));
    locks
        .acquire("collection-upgrade", Duration::from_secs(5), &CancellationSignal::new())
        .await
        .expect("lock released after cancelled run");
}
