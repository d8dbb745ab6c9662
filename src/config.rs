//! Watcher server configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Quiet period before a change window is delivered.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// How often an absent watch root is checked for existence.
pub const DEFAULT_ROOT_POLL_MS: u64 = 500;

/// Scan interval of the polling native backend.
pub const DEFAULT_NATIVE_POLL_MS: u64 = 2_000;

/// Which native primitive backs live watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The platform's event API (inotify, FSEvents, ReadDirectoryChangesW).
    #[default]
    Recommended,
    /// Periodic directory scans, for filesystems without change events.
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub backend: BackendKind,
    pub native_poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            poll_interval_ms: DEFAULT_ROOT_POLL_MS,
            backend: BackendKind::default(),
            native_poll_interval_ms: DEFAULT_NATIVE_POLL_MS,
        }
    }
}

impl WatcherConfig {
    /// Parses a JSON settings fragment; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| WatcherError::Config(format!("invalid watcher settings: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(WatcherError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.native_poll_interval_ms == 0 {
            return Err(WatcherError::Config(
                "native_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn native_poll_interval(&self) -> Duration {
        Duration::from_millis(self.native_poll_interval_ms)
    }
}
