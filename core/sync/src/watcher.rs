//! Background connectivity watching: periodic re-probes and network-change
//! notifications.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use plotsync_common::{Error, Result};

use crate::drain::DrainReport;
use crate::manager::SyncManager;

/// Watch mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Only explicit notifications trigger a probe.
    Manual,
    /// Re-probe at regular intervals as well.
    Periodic { interval_secs: u64 },
}

impl WatchMode {
    fn period(&self) -> Option<Duration> {
        match self {
            WatchMode::Manual => None,
            WatchMode::Periodic { interval_secs } => Some(Duration::from_secs((*interval_secs).max(1))),
        }
    }
}

/// Watcher request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchRequest {
    /// The platform reported a network change; re-probe now.
    NetworkChanged,
    /// Drain the queue now if online.
    Drain,
    /// The app is about to be backgrounded; flush best-effort.
    Background,
    /// Stop the watcher.
    Shutdown,
}

/// Answer to a watcher request.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    pub online: bool,
    pub drained: Option<DrainReport>,
}

type Request = (WatchRequest, oneshot::Sender<Result<WatchResponse>>);

/// Sender side of the watcher, held by the application.
#[derive(Clone)]
pub struct ConnectivityWatcher {
    mode: WatchMode,
    request_tx: mpsc::Sender<Request>,
}

impl ConnectivityWatcher {
    /// Create a new watcher with the given mode.
    pub fn new(mode: WatchMode) -> (Self, WatcherHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        (Self { mode, request_tx }, WatcherHandle { mode, request_rx })
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Report a network-change event and wait for the re-probe.
    pub async fn network_changed(&self) -> Result<WatchResponse> {
        self.request(WatchRequest::NetworkChanged).await
    }

    /// Request an immediate drain.
    pub async fn drain(&self) -> Result<WatchResponse> {
        self.request(WatchRequest::Drain).await
    }

    /// Request the best-effort flush before backgrounding.
    pub async fn background(&self) -> Result<WatchResponse> {
        self.request(WatchRequest::Background).await
    }

    /// Shutdown the watcher.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((WatchRequest::Shutdown, response_tx))
            .await;
    }

    async fn request(&self, request: WatchRequest) -> Result<WatchResponse> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Connectivity watcher not running".to_string()))?;

        response_rx.await.map_err(|_| {
            Error::InvalidInput("Connectivity watcher stopped before answering".to_string())
        })?
    }
}

/// Handle for the watcher background task.
pub struct WatcherHandle {
    mode: WatchMode,
    request_rx: mpsc::Receiver<Request>,
}

impl WatcherHandle {
    /// Run the watcher until shutdown or until every sender is dropped.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(mut self, manager: Arc<SyncManager>) {
        let mut ticker = self.mode.period().map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!("Connectivity watcher started ({:?})", self.mode);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        debug!("All watcher senders dropped");
                        break;
                    };
                    if request == WatchRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    let result = Self::handle(&manager, request).await;
                    if let Err(e) = &result {
                        error!("Watcher request {:?} failed: {}", request, e);
                    }
                    let _ = response_tx.send(result);
                }

                _ = Self::tick(&mut ticker) => {
                    debug!("Periodic connectivity probe");
                    manager.is_online().await;
                }
            }
        }

        info!("Connectivity watcher stopped");
    }

    async fn handle(manager: &Arc<SyncManager>, request: WatchRequest) -> Result<WatchResponse> {
        match request {
            WatchRequest::NetworkChanged => {
                let online = manager.is_online().await;
                let drained = manager.wait_for_drain().await;
                Ok(WatchResponse { online, drained })
            }
            WatchRequest::Drain | WatchRequest::Background => {
                if request == WatchRequest::Background {
                    info!("Flushing mutation queue before backgrounding");
                }
                let drained = manager.flush().await?;
                Ok(WatchResponse {
                    online: drained.is_some(),
                    drained,
                })
            }
            WatchRequest::Shutdown => Ok(WatchResponse {
                online: manager.state() == crate::state::ConnectivityState::Online,
                drained: None,
            }),
        }
    }

    async fn tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::connectivity::{ConnectivityMonitor, ManualProbe};
    use crate::manager::SyncConfig;
    use crate::retry::RetryPolicy;
    use plotsync_common::{EntityTable, MutationOp, Record, RecordId};
    use plotsync_storage::{CacheStore, MemoryStore, MutationQueue};

    async fn manager(probe: Arc<ManualProbe>, backend: Arc<MemoryBackend>) -> Arc<SyncManager> {
        let store = Arc::new(MemoryStore::new());
        SyncManager::with_retry(
            ConnectivityMonitor::new(probe, Duration::from_secs(1)),
            CacheStore::new(store.clone()),
            MutationQueue::open(store).await.unwrap(),
            backend,
            RetryPolicy::none(),
            SyncConfig::default(),
        )
    }

    #[test]
    fn test_watch_mode_serde() {
        let mode: WatchMode = serde_json::from_str(r#"{"periodic":{"interval_secs":30}}"#).unwrap();
        assert_eq!(mode, WatchMode::Periodic { interval_secs: 30 });
        assert_eq!(mode.period(), Some(Duration::from_secs(30)));
        assert_eq!(WatchMode::Manual.period(), None);
    }

    #[tokio::test]
    async fn test_network_change_drains_queue() {
        let probe = Arc::new(ManualProbe::new(false));
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager(probe.clone(), backend.clone()).await;

        let tasks = EntityTable::new("tasks").unwrap();
        let mut record = Record::new();
        record.insert("title", "Clear drain");
        manager
            .record_local_write(&tasks, MutationOp::Insert, RecordId::placeholder(), record)
            .await
            .unwrap();

        let (watcher, handle) = ConnectivityWatcher::new(WatchMode::Manual);
        let task = tokio::spawn(handle.run(manager.clone()));

        let offline = watcher.network_changed().await.unwrap();
        assert!(!offline.online);
        assert!(offline.drained.is_none());

        probe.set_online(true);
        let online = watcher.network_changed().await.unwrap();
        assert!(online.online);
        assert_eq!(online.drained.unwrap().applied.len(), 1);
        assert_eq!(backend.rows(&tasks).len(), 1);

        watcher.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_background_flush_offline() {
        let probe = Arc::new(ManualProbe::new(false));
        let manager = manager(probe, Arc::new(MemoryBackend::new())).await;
        let (watcher, handle) = ConnectivityWatcher::new(WatchMode::Manual);
        let task = tokio::spawn(handle.run(manager));

        let response = watcher.background().await.unwrap();
        assert!(!response.online);

        drop(watcher);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_probe() {
        let probe = Arc::new(ManualProbe::new(true));
        let manager = manager(probe.clone(), Arc::new(MemoryBackend::new())).await;
        let (watcher, handle) = ConnectivityWatcher::new(WatchMode::Periodic { interval_secs: 10 });
        let task = tokio::spawn(handle.run(manager));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(probe.probe_count() >= 3);

        watcher.shutdown().await;
        task.await.unwrap();
    }
}
