//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the API base URL, organization id, last used username and
//! the tuning knobs of the sync layer.
//!
//! Configuration is stored at `~/.config/venuedesk/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config directory paths
const APP_NAME: &str = "venuedesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the API base URL
pub const API_URL_ENV: &str = "VENUEDESK_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// Cached results are served without refetching for this long.
const DEFAULT_STALE_TIME_SECS: u64 = 30;

/// Quiet period before a search input is committed.
const DEFAULT_SEARCH_DEBOUNCE_MS: u64 = 500;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_ERROR_MESSAGE: &str = "The request could not be completed";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub organization_id: Option<String>,
    pub last_username: Option<String>,
    pub stale_time_secs: Option<u64>,
    pub search_debounce_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_json(&contents)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Base URL, with the environment taking precedence over the file.
    pub fn api_base_url(&self) -> String {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|url| !url.is_empty())
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn sync_config(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            stale_time: self
                .stale_time_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_time),
            debounce: self
                .search_debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce),
            ..defaults
        }
    }
}

/// Tuning for the query cache, mutation pipeline and search controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a successful result counts as fresh.
    pub stale_time: Duration,
    /// Input silence required before a search commits.
    pub debounce: Duration,
    /// Message used when a failure carries none.
    pub default_error_message: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(DEFAULT_STALE_TIME_SECS),
            debounce: Duration::from_millis(DEFAULT_SEARCH_DEBOUNCE_MS),
            default_error_message: DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }
}
