//! Sync manager: the single online/offline decision point.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use plotsync_common::{EntityTable, Error, MutationOp, Record, RecordId, Result};
use plotsync_storage::{CacheStore, MutationEntry, MutationQueue};

use crate::backend::RemoteBackend;
use crate::connectivity::ConnectivityMonitor;
use crate::drain::{delete_payload, DrainReport, FailedMutation, QueueDrainer};
use crate::retry::RetryPolicy;
use crate::state::{ConnectivityState, ConnectivityTracker, Transition};
use crate::watcher::WatchMode;

/// Configuration for the sync manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for one connectivity probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Transient failures before a queued write is surfaced as failed.
    pub max_attempts: u32,
    /// In-drain retries of a single backend call.
    pub retry_max: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// How the background watcher re-probes connectivity.
    pub watch_mode: WatchMode,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl SyncConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Backoff the drainer applies to each queued mutation.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max,
            Duration::from_millis(self.retry_initial_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3_000,
            max_attempts: 5,
            retry_max: 2,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 5_000,
            watch_mode: WatchMode::Manual,
            event_capacity: 64,
        }
    }
}

/// Notifications published by the sync manager.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConnectivityChanged(Transition),
    DrainCompleted(DrainReport),
    /// A queued write needs user action.
    MutationFailed(FailedMutation),
}

/// Orchestrates connectivity, the local cache and the mutation queue.
///
/// Domain hooks ask `is_online()` before choosing a data path and never
/// probe connectivity themselves. An observed transition to online starts
/// one queue drain in the background; drains never overlap.
pub struct SyncManager {
    monitor: ConnectivityMonitor,
    tracker: Mutex<ConnectivityTracker>,
    cache: CacheStore,
    queue: MutationQueue,
    backend: Arc<dyn RemoteBackend>,
    drainer: QueueDrainer,
    drain_lock: tokio::sync::Mutex<()>,
    drain_tasks: Mutex<Vec<JoinHandle<Option<DrainReport>>>>,
    events: broadcast::Sender<SyncEvent>,
    config: SyncConfig,
}

impl SyncManager {
    /// Create a new sync manager.
    pub fn new(
        monitor: ConnectivityMonitor,
        cache: CacheStore,
        queue: MutationQueue,
        backend: Arc<dyn RemoteBackend>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Self::with_retry(
            monitor,
            cache,
            queue,
            backend,
            config.retry_policy(),
            config,
        )
    }

    /// Create a new sync manager with an explicit in-drain retry policy.
    pub fn with_retry(
        monitor: ConnectivityMonitor,
        cache: CacheStore,
        queue: MutationQueue,
        backend: Arc<dyn RemoteBackend>,
        retry: RetryPolicy,
        config: SyncConfig,
    ) -> Arc<Self> {
        let drainer = QueueDrainer::new(
            cache.clone(),
            queue.clone(),
            backend.clone(),
            retry,
            config.max_attempts,
        );
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Arc::new(Self {
            monitor,
            tracker: Mutex::new(ConnectivityTracker::new()),
            cache,
            queue,
            backend,
            drainer,
            drain_lock: tokio::sync::Mutex::new(()),
            drain_tasks: Mutex::new(Vec::new()),
            events,
            config,
        })
    }

    fn tracker(&self) -> MutexGuard<'_, ConnectivityTracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drain_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<Option<DrainReport>>>> {
        self.drain_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Probe connectivity and record the result.
    ///
    /// A transition to online spawns a drain and returns without waiting
    /// for it.
    pub async fn is_online(self: &Arc<Self>) -> bool {
        let online = self.monitor.is_online().await;
        let transition = self.tracker().observe(online);

        if let Some(transition) = transition {
            info!("Connectivity {} -> {}", transition.from, transition.to);
            self.emit(SyncEvent::ConnectivityChanged(transition));
            if transition.is_online_edge() {
                self.spawn_drain();
            }
        }
        online
    }

    fn spawn_drain(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match manager.drain().await {
                Ok(report) => Some(report),
                Err(e) => {
                    error!("Background drain failed: {}", e);
                    None
                }
            }
        });

        let mut tasks = self.drain_tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Wait for drains started by online transitions.
    ///
    /// Returns the report of the most recent one, if any was started.
    pub async fn wait_for_drain(&self) -> Option<DrainReport> {
        let tasks: Vec<_> = std::mem::take(&mut *self.drain_tasks());
        let mut last = None;
        for task in tasks {
            match task.await {
                Ok(report) => last = report.or(last),
                Err(e) => warn!("Drain task ended abnormally: {}", e),
            }
        }
        last
    }

    /// Replay the queue against the backend.
    ///
    /// A drain already in progress finishes before this one starts.
    ///
    /// # Errors
    /// - Local storage failure
    pub async fn drain(&self) -> Result<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let report = self.drainer.drain().await?;

        for failure in report.terminal_failures() {
            self.emit(SyncEvent::MutationFailed(failure.clone()));
        }
        self.emit(SyncEvent::DrainCompleted(report.clone()));
        Ok(report)
    }

    /// Best-effort drain, e.g. before the app is backgrounded.
    ///
    /// Returns `None` when offline.
    pub async fn flush(self: &Arc<Self>) -> Result<Option<DrainReport>> {
        if !self.is_online().await {
            debug!("Flush skipped while offline");
            return Ok(None);
        }
        if let Some(report) = self.wait_for_drain().await {
            if report.is_clean() {
                return Ok(Some(report));
            }
        }
        self.drain().await.map(Some)
    }

    /// Record a write that could not reach the backend.
    ///
    /// Appends the queue entry, then writes the pending snapshot (or drops
    /// the cached record for a DELETE). Both steps complete even if the
    /// caller stops waiting.
    ///
    /// # Errors
    /// - Local storage failure; nothing is queued if the queue append fails
    pub async fn record_local_write(
        &self,
        table: &EntityTable,
        op: MutationOp,
        record_id: RecordId,
        record: Record,
    ) -> Result<MutationEntry> {
        let cache = self.cache.clone();
        let queue = self.queue.clone();
        let table = table.clone();

        let task = tokio::spawn(async move {
            let payload = match op {
                MutationOp::Delete => delete_payload(&record_id),
                MutationOp::Insert | MutationOp::Update => {
                    let mut payload = record;
                    payload.set_id(&record_id);
                    payload
                }
            };
            let entry = queue
                .enqueue(&table, op, Some(record_id.clone()), payload.clone())
                .await?;
            match op {
                MutationOp::Delete => {
                    cache.remove(&table, &record_id).await?;
                }
                MutationOp::Insert | MutationOp::Update => {
                    cache.put_pending(&table, &record_id, payload).await?;
                }
            }
            Ok(entry)
        });

        task.await
            .map_err(|e| Error::Storage(format!("Local write task failed: {}", e)))?
    }

    /// Terminally failed writes awaiting user action.
    pub async fn failed_mutations(&self) -> Result<Vec<MutationEntry>> {
        self.queue.failed().await
    }

    /// Put a failed write back in line for the next drain.
    pub async fn retry_failed(&self, seq: u64) -> Result<MutationEntry> {
        let _guard = self.drain_lock.lock().await;
        self.queue.retry_failed(seq).await
    }

    /// Give up on a failed write and drop its pending snapshot.
    pub async fn discard_failed(&self, seq: u64) -> Result<MutationEntry> {
        let _guard = self.drain_lock.lock().await;
        let entry = self.queue.discard_failed(seq).await?;

        if let Some(id) = &entry.record_id {
            let still_queued = self
                .queue
                .entries()
                .await?
                .iter()
                .any(|e| e.table == entry.table && e.record_id.as_ref() == Some(id));
            if !still_queued && self.cache.is_pending(&entry.table, id).await? {
                self.cache.remove(&entry.table, id).await?;
                debug!("Dropped pending snapshot {} of {}", id, entry.table);
            }
        }
        Ok(entry)
    }

    /// Last observed connectivity.
    pub fn state(&self) -> ConnectivityState {
        self.tracker().state()
    }

    pub fn last_transition(&self) -> Option<Transition> {
        self.tracker().last_transition()
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
        &self.backend
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::connectivity::ManualProbe;
    use plotsync_common::SyncStatus;
    use plotsync_storage::MemoryStore;
    use serde_json::json;

    async fn manager(online: bool) -> (Arc<SyncManager>, Arc<ManualProbe>, Arc<MemoryBackend>) {
        let store = Arc::new(MemoryStore::new());
        let probe = Arc::new(ManualProbe::new(online));
        let backend = Arc::new(MemoryBackend::new());
        let manager = SyncManager::with_retry(
            ConnectivityMonitor::new(probe.clone(), Duration::from_secs(1)),
            CacheStore::new(store.clone()),
            MutationQueue::open(store).await.unwrap(),
            backend.clone(),
            RetryPolicy::none(),
            SyncConfig::default(),
        );
        (manager, probe, backend)
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: SyncConfig = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.watch_mode, WatchMode::Manual);
    }

    #[tokio::test]
    async fn test_state_follows_probes() {
        let (manager, probe, _) = manager(false).await;
        assert_eq!(manager.state(), ConnectivityState::Unknown);

        assert!(!manager.is_online().await);
        assert_eq!(manager.state(), ConnectivityState::Offline);

        probe.set_online(true);
        assert!(manager.is_online().await);
        assert_eq!(manager.state(), ConnectivityState::Online);
        assert!(manager.wait_for_drain().await.is_some());
    }

    #[tokio::test]
    async fn test_drain_only_on_transition() {
        let (manager, probe, _) = manager(false).await;
        let mut events = manager.subscribe();
        manager.is_online().await;
        probe.set_online(true);
        manager.is_online().await;
        manager.wait_for_drain().await;

        // Subsequent reads while online do not drain again.
        manager.is_online().await;
        assert!(manager.wait_for_drain().await.is_none());

        let mut drains = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::DrainCompleted(_)) {
                drains += 1;
            }
        }
        assert_eq!(drains, 1);
    }

    #[tokio::test]
    async fn test_record_local_write_queues_and_caches() {
        let (manager, _, _) = manager(false).await;
        let tasks = EntityTable::new("tasks").unwrap();
        let id = RecordId::placeholder();

        let entry = manager
            .record_local_write(&tasks, MutationOp::Insert, id.clone(), record(json!({"title": "Mow"})))
            .await
            .unwrap();
        assert_eq!(entry.payload.id(), Some(id.clone()));

        let cached = manager.cache().get_one(&tasks, &id).await.unwrap().unwrap();
        assert_eq!(cached.sync_status, SyncStatus::Pending);
        assert_eq!(manager.queue().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_discard_failed_drops_pending_snapshot() {
        let (manager, probe, backend) = manager(false).await;
        let docs = EntityTable::new("documents").unwrap();
        let id = RecordId::placeholder();
        manager
            .record_local_write(&docs, MutationOp::Insert, id.clone(), record(json!({"title": "Map"})))
            .await
            .unwrap();

        backend.fail_table(&docs, crate::backend::FailureMode::Permanent, None);
        probe.set_online(true);
        manager.is_online().await;
        let report = manager.wait_for_drain().await.unwrap();
        assert_eq!(report.terminal_failures().count(), 1);

        let failed = manager.failed_mutations().await.unwrap();
        assert_eq!(failed.len(), 1);
        manager.discard_failed(failed[0].seq).await.unwrap();

        assert!(manager.queue().is_empty().await.unwrap());
        assert!(manager.cache().get_one(&docs, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_offline_is_noop() {
        let (manager, _, backend) = manager(false).await;
        assert!(manager.flush().await.unwrap().is_none());
        assert!(backend.calls().is_empty());
    }
}
