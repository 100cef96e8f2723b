//! Table replication for Replica.
//!
//! Keeps a local SQLite copy of a subset of server-side tables current and
//! tells every local consumer exactly what changed.
//!
//! # Architecture
//!
//! - **Host**: one actor task owning the store, the shapes and the consumer
//!   registry. All requests and refreshes go through its command queue.
//! - **Shapes**: one per replicated table. Seeded by a full fetch, then
//!   re-fetched on a fixed period and diffed against a snapshot.
//! - **Schema guard**: compares the server's schema fingerprint with the
//!   persisted one before the store is opened and wipes the store when
//!   they differ.
//! - **Consumers**: duplex channels with correlated requests and
//!   broadcasts.
//! - **Topology**: one shared host, or one private host per consumer when
//!   the runtime cannot share.
//!
//! # Example
//!
//! ```no_run
//! use replica_sync::{remote::HttpRemote, start_host, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> replica_sync::SyncResult<()> {
//! let config = SyncConfig {
//!     server_url: "https://example.com".to_string(),
//!     ..Default::default()
//! };
//! let remote = Arc::new(HttpRemote::from_config(&config)?);
//! let host = start_host(config, remote).await?;
//!
//! let consumer = host.connect().await?;
//! consumer.init().await?;
//! consumer.start_shape("todos", "todos", "/shapes/todos", None).await?;
//! let rows = consumer.query("SELECT * FROM todos", vec![]).await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod capabilities;
mod config;
mod consumer;
pub mod diff;
mod error;
mod host;
pub mod protocol;
pub mod remote;
pub mod schema_guard;
mod shape;
mod task;
mod topology;

pub use broadcast::Broadcaster;
pub use config::{StorageChoice, SyncConfig, TopologyChoice};
pub use consumer::{Consumer, ShapeWatcher};
pub use diff::{diff, Snapshot};
pub use error::{SyncError, SyncResult};
pub use host::HostHandle;
pub use protocol::{
    decode_request, Broadcast, DecodeError, ExecOutcome, HostMessage, HostStatus, InitOutcome,
    Pong, Reply, Request, RequestEnvelope, ResetReason, StartOutcome, StopOutcome,
};
pub use remote::{HttpRemote, RemoteSource, SchemaManifest};
pub use schema_guard::{Reconciliation, SchemaGuard};
pub use shape::ShapeRequest;
pub use topology::{select_host, start_host, PerConsumerHost, SharedHost, SyncHost};
