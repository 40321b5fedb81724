//! Service configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Root configuration for the scheduler service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Data directory holding the JSON collections and env overrides.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Ceiling for scheduled runs, in seconds.
    #[serde(default = "default_scheduled_timeout")]
    pub scheduled_timeout_secs: u64,
    /// Ceiling for ad-hoc (manual) runs, in seconds.
    #[serde(default = "default_manual_timeout")]
    pub manual_timeout_secs: u64,
    /// Keep at most this many run logs on disk.
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".scriptbeat")
}

fn default_scheduled_timeout() -> u64 {
    10 * 60
}

fn default_manual_timeout() -> u64 {
    5 * 60
}

fn default_log_retention() -> usize {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scheduled_timeout_secs: default_scheduled_timeout(),
            manual_timeout_secs: default_manual_timeout(),
            log_retention: default_log_retention(),
        }
    }
}

impl ServiceConfig {
    /// Load config from the default path (~/.scriptbeat/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Directory where materialized/managed scripts live.
    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }
}
