//! Core type definitions for Replica.
//!
//! This crate defines the plain data types shared by the store adapter,
//! the sync host and its consumers:
//! - Consumer identifiers (UUID v7)
//! - Rows, primary keys and key specifications
//! - Change sets produced by snapshot diffing
//! - Runtime capabilities and the choices derived from them
//! - Schema fingerprints
//!
//! Nothing in here performs I/O.

mod capabilities;
mod change;
mod ids;
mod row;
mod version;

pub use capabilities::{Capabilities, StorageMode, Topology};
pub use change::{ChangeSet, RowUpdate};
pub use ids::ConsumerId;
pub use row::{into_row, KeySpec, PrimaryKey, Row};
pub use version::SchemaVersion;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid key spec: {0}")]
    InvalidKeySpec(String),

    #[error("row is not a JSON object")]
    NotAnObject,
}
