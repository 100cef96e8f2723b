//! Runtime capabilities and the topology/storage choices derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the runtime supports, as detected once at host start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// One shared host can serve many concurrent consumers.
    pub multi_consumer_worker_supported: bool,
    /// Fast durable file storage (write-ahead logged) is usable.
    pub durable_fast_storage_supported: bool,
}

impl Capabilities {
    /// Everything supported.
    pub const fn full() -> Self {
        Self {
            multi_consumer_worker_supported: true,
            durable_fast_storage_supported: true,
        }
    }

    /// Nothing supported; the most conservative choices follow.
    pub const fn none() -> Self {
        Self {
            multi_consumer_worker_supported: false,
            durable_fast_storage_supported: false,
        }
    }

    /// Topology these capabilities allow.
    pub fn topology(&self) -> Topology {
        if self.multi_consumer_worker_supported {
            Topology::Shared
        } else {
            Topology::PerConsumer
        }
    }

    /// Storage backend these capabilities allow.
    pub fn storage_mode(&self) -> StorageMode {
        if self.durable_fast_storage_supported {
            StorageMode::Durable
        } else {
            StorageMode::Compat
        }
    }
}

/// How hosts are laid out relative to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// One host, one store, all consumers attached to it.
    Shared,
    /// One independent host and store per consumer. Remote fetches are
    /// not deduplicated across consumers.
    PerConsumer,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::PerConsumer => write!(f, "per_consumer"),
        }
    }
}

/// Storage backend of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// File storage with a write-ahead log.
    Durable,
    /// File storage with a rollback journal; works on any filesystem.
    Compat,
    /// In-memory only. Used by tests.
    Memory,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable => write!(f, "durable"),
            Self::Compat => write!(f, "compat"),
            Self::Memory => write!(f, "memory"),
        }
    }
}
