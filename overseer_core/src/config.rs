//! Observer configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::poll::PollConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for an observer session.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Address of the partition registry (default: 127.0.0.1:5000)
    pub registry_addr: String,

    /// Minimum time between two remote step queries, in ms (default: 1000)
    pub refresh_interval_ms: u64,

    /// Sleep before every poll iteration, in ms (default: 25)
    pub sleep_quantum_ms: u64,

    /// Per-call transport timeout, in ms (default: 5000)
    pub call_timeout_ms: u64,

    /// Partition whose fields are shown initially (default: 0)
    pub viewed_partition: u32,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            registry_addr: "127.0.0.1:5000".to_string(),
            refresh_interval_ms: 1000,
            sleep_quantum_ms: 25,
            call_timeout_ms: 5000,
            viewed_partition: 0,
        }
    }
}

impl ObserverConfig {
    /// Loads a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sleep_quantum_ms == 0 {
            return Err(ConfigError::Invalid("sleep_quantum_ms must be positive".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("call_timeout_ms must be positive".into()));
        }
        if self.registry_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("registry_addr is empty".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            sleep_quantum: Duration::from_millis(self.sleep_quantum_ms),
            refresh_interval: Duration::from_millis(self.refresh_interval_ms),
        }
    }
}
