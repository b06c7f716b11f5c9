//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use plotsync_common::{Error, Result, Secret};
use plotsync_sync::SyncConfig;

use crate::viewer::Viewer;

/// Environment variable overriding the backend URL.
pub const ENV_BACKEND_URL: &str = "PLOTSYNC_BACKEND_URL";
/// Environment variable overriding the API key.
pub const ENV_API_KEY: &str = "PLOTSYNC_API_KEY";

/// Local store selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Registered store name (`memory` or `sqlite`).
    pub kind: String,
    /// Database file for the `sqlite` store; defaults under the user data
    /// directory.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Parameters handed to the store factory.
    pub fn params(&self) -> serde_json::Value {
        match self.kind.as_str() {
            "sqlite" => {
                let path = self.path.clone().unwrap_or_else(default_store_path);
                serde_json::json!({ "path": path.to_string_lossy() })
            }
            _ => serde_json::Value::Null,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            path: None,
        }
    }
}

/// Default location of the on-device database.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plotsync")
        .join("plotsync.db")
}

/// Configuration of one app installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the remote backend (e.g. `https://xyz.supabase.co`).
    pub backend_url: String,
    /// Public API key sent with every backend request.
    pub api_key: Secret,
    /// Health URL probed for connectivity; defaults to the REST root.
    pub probe_url: Option<String>,
    pub store: StoreConfig,
    /// Signed-in user.
    pub viewer: Viewer,
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Load configuration from a JSON file, then apply environment
    /// overrides. A missing file yields the defaults.
    ///
    /// # Errors
    /// - File unreadable
    /// - Invalid JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let json = std::fs::read_to_string(path)?;
            Self::from_json(&json)?
        } else {
            debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Write configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BACKEND_URL).filter(|v| !v.is_empty()) {
            self.backend_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.api_key = Secret::new(key);
        }
    }

    /// URL probed by the connectivity monitor.
    pub fn probe_url(&self) -> String {
        match &self.probe_url {
            Some(url) => url.clone(),
            None => format!("{}/rest/v1/", self.backend_url.trim_end_matches('/')),
        }
    }

    /// Check the fields needed to talk to the backend.
    pub fn validate(&self) -> Result<()> {
        if self.backend_url.is_empty() {
            return Err(Error::InvalidInput(format!(
                "backend_url is not set (config file or {})",
                ENV_BACKEND_URL
            )));
        }
        if self.viewer.user_id.is_empty() {
            return Err(Error::InvalidInput("viewer.user_id is not set".to_string()));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}
