//! Composition root wiring store, backend, connectivity and hooks.

use std::sync::Arc;
use tracing::info;

use plotsync_common::Result;
use plotsync_storage::{create_default_registry, CacheStore, LocalStore, MutationQueue, StoreRegistry};
use plotsync_sync::{
    ConnectivityMonitor, ConnectivityProbe, ConnectivityWatcher, HttpProbe, RemoteBackend,
    SyncConfig, SyncManager,
};

use crate::config::AppConfig;
use crate::hooks::{Documents, Inspections, Plots, Rules, Tasks};
use crate::rest::RestBackend;
use crate::viewer::Viewer;

/// One app session: the sync services plus the signed-in viewer.
///
/// Every service is constructed here and handed down explicitly; nothing
/// is global.
pub struct PlotSync {
    sync: Arc<SyncManager>,
    viewer: Viewer,
}

impl PlotSync {
    /// Open a session from configuration, probing the backend over HTTP.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Local store failed to open
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let probe = Arc::new(HttpProbe::new(&config.probe_url(), config.sync.probe_timeout())?);
        Self::open_with_probe(config, probe).await
    }

    /// Open a session with a caller-supplied connectivity probe.
    pub async fn open_with_probe(config: &AppConfig, probe: Arc<dyn ConnectivityProbe>) -> Result<Self> {
        Self::open_with_registry(config, probe, &create_default_registry()).await
    }

    /// Open a session resolving the local store from `registry`.
    pub async fn open_with_registry(
        config: &AppConfig,
        probe: Arc<dyn ConnectivityProbe>,
        registry: &StoreRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let store = registry.resolve(&config.store.kind, config.store.params())?;
        let backend: Arc<dyn RemoteBackend> =
            Arc::new(RestBackend::new(&config.backend_url, config.api_key.clone())?);

        info!(
            store = store.name(),
            backend = %config.backend_url,
            "Opening PlotSync session for {}",
            config.viewer.user_id
        );
        Self::from_parts(store, backend, probe, config.viewer.clone(), config.sync.clone()).await
    }

    /// Assemble a session from explicit parts.
    pub async fn from_parts(
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        probe: Arc<dyn ConnectivityProbe>,
        viewer: Viewer,
        sync_config: SyncConfig,
    ) -> Result<Self> {
        let monitor = ConnectivityMonitor::new(probe, sync_config.probe_timeout());
        let cache = CacheStore::new(store.clone());
        let queue = MutationQueue::open(store).await?;
        let sync = SyncManager::new(monitor, cache, queue, backend, sync_config);
        Ok(Self { sync, viewer })
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn documents(&self) -> Documents {
        Documents::new(self.sync.clone(), self.viewer.clone())
    }

    pub fn rules(&self) -> Rules {
        Rules::new(self.sync.clone(), self.viewer.clone())
    }

    pub fn inspections(&self) -> Inspections {
        Inspections::new(self.sync.clone(), self.viewer.clone())
    }

    pub fn tasks(&self) -> Tasks {
        Tasks::new(self.sync.clone(), self.viewer.clone())
    }

    pub fn plots(&self) -> Plots {
        Plots::new(self.sync.clone(), self.viewer.clone())
    }

    /// Spawn the connectivity watcher configured in `SyncConfig`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_watcher(&self) -> (ConnectivityWatcher, tokio::task::JoinHandle<()>) {
        let (watcher, handle) = ConnectivityWatcher::new(self.sync.config().watch_mode);
        let task = tokio::spawn(handle.run(self.sync.clone()));
        (watcher, task)
    }
}
