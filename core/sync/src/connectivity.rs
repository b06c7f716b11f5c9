//! Connectivity probing with a fail-safe offline default.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use plotsync_common::{Error, Result};

/// A single reachability check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Returns whether the backend looks reachable right now.
    async fn probe(&self) -> Result<bool>;
}

/// Answers "am I online" within a bounded time.
///
/// Any probe error or timeout is reported as offline, which routes writes
/// to the durable queue instead of risking a lost write.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, timeout: Duration) -> Self {
        Self { probe, timeout }
    }

    /// Probe connectivity, treating uncertainty as offline.
    pub async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.probe.probe()).await {
            Ok(Ok(online)) => online,
            Ok(Err(e)) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Connectivity probe timed out after {:?}", self.timeout);
                false
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Probe that issues a `HEAD` request against a health URL.
///
/// Any response below 500 counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    /// Create a probe for `url` with a per-request timeout.
    ///
    /// # Errors
    /// - Invalid URL
    /// - HTTP client construction failure
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("Invalid probe URL {}: {}", url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> Result<bool> {
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(e.to_string())
                } else {
                    Error::Network(e.to_string())
                }
            })?;
        Ok(response.status().as_u16() < 500)
    }
}

/// Probe whose answer is set by hand.
///
/// Backs the CLI `--offline` switch and the test suites; can also be made to
/// hang to exercise the timeout path.
#[derive(Debug, Default)]
pub struct ManualProbe {
    online: AtomicBool,
    delay: Mutex<Option<Duration>>,
    probes: AtomicUsize,
}

impl ManualProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            delay: Mutex::new(None),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delay every probe answer.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut current) = self.delay.lock() {
            *current = delay;
        }
    }

    /// Number of probes answered or started.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn probe(&self) -> Result<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.online.load(Ordering::SeqCst))
    }
}
