//! Host configuration.

use crate::error::{SyncError, SyncResult};
use replica_db::{StoreLocation, DEFAULT_STORE_NAME};
use replica_types::{Capabilities, KeySpec, StorageMode, Topology};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Topology selection. `Auto` follows the detected capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyChoice {
    #[default]
    Auto,
    Shared,
    PerConsumer,
}

impl TopologyChoice {
    /// The topology to run with.
    pub fn resolve(self, capabilities: &Capabilities) -> Topology {
        match self {
            Self::Auto => capabilities.topology(),
            Self::Shared => Topology::Shared,
            Self::PerConsumer => Topology::PerConsumer,
        }
    }
}

/// Storage backend selection. `Auto` follows the detected capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageChoice {
    #[default]
    Auto,
    Durable,
    Compat,
    Memory,
}

impl StorageChoice {
    /// The storage mode to open the store with.
    pub fn resolve(self, capabilities: &Capabilities) -> StorageMode {
        match self {
            Self::Auto => capabilities.storage_mode(),
            Self::Durable => StorageMode::Durable,
            Self::Compat => StorageMode::Compat,
            Self::Memory => StorageMode::Memory,
        }
    }
}

/// Configuration for a sync host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding the store and the fingerprint slot.
    pub data_dir: PathBuf,
    /// Base name of the store file.
    pub store_name: String,
    /// Base URL of the remote source.
    pub server_url: String,
    /// Shape refresh period (ms).
    pub refresh_interval_ms: u64,
    /// How long a consumer waits for a reply (ms).
    pub request_timeout_ms: u64,
    /// HTTP timeout for remote calls (ms).
    pub http_timeout_ms: u64,
    /// Column(s) identifying a row.
    pub primary_key: KeySpec,
    pub topology: TopologyChoice,
    pub storage: StorageChoice,
    /// Capacity of the host's command queue.
    pub command_queue: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("replica-data"),
            store_name: DEFAULT_STORE_NAME.to_string(),
            server_url: "http://localhost:3000".to_string(),
            refresh_interval_ms: 500,
            request_timeout_ms: 30_000,
            http_timeout_ms: 15_000,
            primary_key: KeySpec::default(),
            topology: TopologyChoice::Auto,
            storage: StorageChoice::Auto,
            command_queue: 256,
        }
    }
}

impl SyncConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the host cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.refresh_interval_ms == 0 {
            return Err(SyncError::Config("refresh_interval_ms must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be positive".into()));
        }
        if self.command_queue == 0 {
            return Err(SyncError::Config("command_queue must be positive".into()));
        }
        if self.store_name.is_empty() || self.store_name.contains(['/', '\\']) {
            return Err(SyncError::Config(format!(
                "invalid store name '{}'",
                self.store_name
            )));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Where the store lives.
    pub fn location(&self) -> StoreLocation {
        StoreLocation::new(&self.data_dir, &self.store_name)
    }

    /// The configuration of the `index`-th consumer's private host in the
    /// per-consumer topology.
    pub fn for_consumer(&self, index: u64) -> Self {
        Self {
            data_dir: self.data_dir.join("consumers").join(index.to_string()),
            ..self.clone()
        }
    }
}
