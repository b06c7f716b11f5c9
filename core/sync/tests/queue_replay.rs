//! Replay behavior of the sync manager against a recording backend.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use plotsync_common::{EntityTable, MutationOp, Record, RecordId, SyncStatus};
use plotsync_storage::{CacheStore, LocalStore, MemoryStore, MutationQueue, MutationStatus, SqliteStore};
use plotsync_sync::{
    ConnectivityMonitor, ConnectivityState, FailureMode, ManualProbe, MemoryBackend, RetryPolicy,
    SyncConfig, SyncEvent, SyncManager,
};

struct Harness {
    manager: Arc<SyncManager>,
    probe: Arc<ManualProbe>,
    backend: Arc<MemoryBackend>,
}

async fn harness_with(store: Arc<dyn LocalStore>, online: bool) -> Harness {
    let probe = Arc::new(ManualProbe::new(online));
    let backend = Arc::new(MemoryBackend::new());
    let manager = SyncManager::with_retry(
        ConnectivityMonitor::new(probe.clone(), Duration::from_secs(2)),
        CacheStore::new(store.clone()),
        MutationQueue::open(store).await.unwrap(),
        backend.clone(),
        RetryPolicy::none(),
        SyncConfig::default(),
    );
    Harness {
        manager,
        probe,
        backend,
    }
}

async fn harness(online: bool) -> Harness {
    harness_with(Arc::new(MemoryStore::new()), online).await
}

fn table(name: &str) -> EntityTable {
    EntityTable::new(name).unwrap()
}

fn record(value: serde_json::Value) -> Record {
    Record::from_value(value).unwrap()
}

impl Harness {
    async fn go_offline(&self) {
        self.probe.set_online(false);
        assert!(!self.manager.is_online().await);
    }

    async fn go_online(&self) {
        self.probe.set_online(true);
        assert!(self.manager.is_online().await);
    }

    async fn write_offline(&self, table: &EntityTable, op: MutationOp, id: RecordId, value: serde_json::Value) {
        self.manager
            .record_local_write(table, op, id, record(value))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_fifo_order_per_table() {
    let h = harness(false).await;
    h.go_offline().await;

    let tasks = table("tasks");
    h.backend
        .seed(&tasks, vec![record(json!({"id": "t1", "status": "open"}))])
        .unwrap();
    for (n, status) in ["claimed", "in_progress", "done"].iter().enumerate() {
        h.write_offline(
            &tasks,
            MutationOp::Update,
            RecordId::new("t1"),
            json!({"status": status, "n": n + 1}),
        )
        .await;
    }

    h.go_online().await;
    let report = h.manager.wait_for_drain().await.unwrap();
    assert_eq!(report.applied.len(), 3);

    let seen: Vec<i64> = h
        .backend
        .mutation_calls()
        .iter()
        .map(|c| c.payload.as_ref().unwrap().get("n").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(h.backend.rows(&tasks)[0].get_str("status"), Some("done"));
}

#[tokio::test]
async fn test_offline_insert_round_trip() {
    let h = harness(false).await;
    h.go_offline().await;

    let inspections = table("inspections");
    let local = RecordId::placeholder();
    h.write_offline(
        &inspections,
        MutationOp::Insert,
        local.clone(),
        json!({"plot_id": "P1", "score": 80}),
    )
    .await;

    let cached = h.manager.cache().entries(&inspections).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].table, "inspections_cache");
    assert_eq!(cached[0].sync_status, SyncStatus::Pending);

    let queued = h.manager.queue().entries().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].table, inspections);
    assert_eq!(queued[0].op, MutationOp::Insert);
    assert_eq!(queued[0].payload.get_str("plot_id"), Some("P1"));

    h.go_online().await;
    h.manager.wait_for_drain().await.unwrap();

    let cached = h.manager.cache().entries(&inspections).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id.as_str(), "srv-1");
    assert_eq!(cached[0].sync_status, SyncStatus::Synced);
    assert_eq!(cached[0].record.get("score"), Some(&json!(80)));
    assert!(h.manager.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_partial_failure_isolation() {
    let h = harness(false).await;
    h.go_offline().await;

    let docs = table("documents");
    let rules = table("rules");
    h.write_offline(&docs, MutationOp::Insert, RecordId::placeholder(), json!({"title": "Lease"}))
        .await;
    h.write_offline(&rules, MutationOp::Insert, RecordId::placeholder(), json!({"title": "No hosepipes"}))
        .await;
    h.backend.fail_table(&docs, FailureMode::Transient, None);

    h.go_online().await;
    let report = h.manager.wait_for_drain().await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].table, rules);
    assert_eq!(report.failed.len(), 1);
    assert!(!report.failed[0].terminal);

    let remaining = h.manager.queue().entries().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].table, docs);
    assert_eq!(remaining[0].status, MutationStatus::Pending);

    // Retried on the next online transition.
    h.backend.heal_table(&docs);
    h.go_offline().await;
    h.go_online().await;
    h.manager.wait_for_drain().await.unwrap();
    assert!(h.manager.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_permanent_failure_is_surfaced() {
    let h = harness(false).await;
    h.go_offline().await;
    let mut events = h.manager.subscribe();

    let docs = table("documents");
    h.write_offline(&docs, MutationOp::Insert, RecordId::placeholder(), json!({"title": "Minutes"}))
        .await;
    h.backend.fail_table(&docs, FailureMode::Permanent, None);

    h.go_online().await;
    h.manager.wait_for_drain().await.unwrap();

    let mut surfaced = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::MutationFailed(failure) = event {
            surfaced.push(failure);
        }
    }
    assert_eq!(surfaced.len(), 1);
    assert!(surfaced[0].error.contains("row-level security"));

    let failed = h.manager.failed_mutations().await.unwrap();
    assert_eq!(failed.len(), 1);

    h.backend.heal_table(&docs);
    h.manager.retry_failed(failed[0].seq).await.unwrap();
    let report = h.manager.drain().await.unwrap();
    assert_eq!(report.applied.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_probe_timeout_means_offline() {
    let h = harness(true).await;
    h.probe.set_delay(Some(Duration::from_secs(60)));

    assert!(!h.manager.is_online().await);
    assert_eq!(h.manager.state(), ConnectivityState::Offline);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_no_double_drain() {
    let h = harness(false).await;
    h.go_offline().await;

    let tasks = table("tasks");
    for n in 0..3 {
        h.write_offline(&tasks, MutationOp::Insert, RecordId::placeholder(), json!({"n": n}))
            .await;
    }
    h.backend.set_latency(Some(Duration::from_millis(20)));

    // Two quick online edges.
    h.go_online().await;
    h.go_offline().await;
    h.go_online().await;
    let (a, b) = tokio::join!(h.manager.drain(), h.manager.wait_for_drain());
    a.unwrap();
    b.unwrap();

    assert_eq!(h.backend.mutation_calls().len(), 3);
    assert_eq!(h.backend.rows(&tasks).len(), 3);
    assert!(h.manager.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_enqueue_during_drain_waits_for_next_pass() {
    let h = harness(false).await;
    h.go_offline().await;

    let rules = table("rules");
    h.write_offline(&rules, MutationOp::Insert, RecordId::placeholder(), json!({"title": "A"}))
        .await;
    h.backend.set_latency(Some(Duration::from_millis(50)));

    let manager = h.manager.clone();
    let drain = tokio::spawn(async move { manager.drain().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.write_offline(&rules, MutationOp::Insert, RecordId::placeholder(), json!({"title": "B"}))
        .await;

    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(h.manager.queue().len().await.unwrap(), 1);

    let report = h.manager.drain().await.unwrap();
    assert_eq!(report.applied.len(), 1);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("plotsync.db");
    let tasks = table("tasks");

    {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let h = harness_with(store, false).await;
        h.go_offline().await;
        h.write_offline(&tasks, MutationOp::Insert, RecordId::placeholder(), json!({"title": "Compost"}))
            .await;
    }

    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let h = harness_with(store, true).await;
    assert_eq!(h.manager.queue().len().await.unwrap(), 1);
    let cached = h.manager.cache().entries(&tasks).await.unwrap();
    assert_eq!(cached[0].sync_status, SyncStatus::Pending);

    h.go_online().await;
    let report = h.manager.wait_for_drain().await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(h.backend.rows(&tasks).len(), 1);
}
