//! Host ↔ consumer messages.
//!
//! Everything on the consumer channel is a JSON object tagged by `type`:
//!
//! - requests carry an `id` chosen by the consumer
//! - replies echo that `id` as `<REQUEST>_RESULT` or `ERROR`
//! - broadcasts carry no `id` and go to every consumer
//!
//! The same encoding is used in process and over the host binary's HTTP
//! surface.

use replica_types::{Capabilities, ChangeSet, Row, SchemaVersion, StorageMode, Topology};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Request types the host understands.
pub const REQUEST_TYPES: &[&str] = &[
    "INIT",
    "SYNC_SHAPE",
    "STOP_SHAPE",
    "FORCE_RESET",
    "QUERY",
    "EXEC",
    "GET_STATUS",
    "PING",
];

/// A request from a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    /// Open the store, reconciling the schema fingerprint first.
    Init,
    /// Start replicating a table.
    SyncShape {
        shape_name: String,
        table_name: String,
        shape_url: String,
        /// DDL to use instead of the cached or fetched one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
    },
    StopShape {
        shape_name: String,
    },
    /// Wipe everything and re-initialize.
    ForceReset,
    Query {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Exec {
        sql: String,
    },
    GetStatus,
    Ping,
}

impl Request {
    /// The wire `type` of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::SyncShape { .. } => "SYNC_SHAPE",
            Self::StopShape { .. } => "STOP_SHAPE",
            Self::ForceReset => "FORCE_RESET",
            Self::Query { .. } => "QUERY",
            Self::Exec { .. } => "EXEC",
            Self::GetStatus => "GET_STATUS",
            Self::Ping => "PING",
        }
    }
}

/// A request with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// A request that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DecodeError {
    /// The request id, when one could be read.
    pub id: Option<u64>,
    pub message: String,
}

impl DecodeError {
    /// The `ERROR` reply for this failure.
    pub fn into_reply(self) -> Reply {
        Reply::Error {
            id: self.id,
            error: self.message,
        }
    }
}

/// Decodes a request envelope from JSON text.
///
/// Unknown request types are rejected; the error keeps the request id when
/// the envelope had a readable one so the caller can still correlate it.
pub fn decode_request(text: &str) -> Result<RequestEnvelope, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError {
        id: None,
        message: format!("invalid JSON: {e}"),
    })?;
    decode_request_value(value)
}

/// Like [`decode_request`], for an already parsed value.
pub fn decode_request_value(value: Value) -> Result<RequestEnvelope, DecodeError> {
    let id = value.get("id").and_then(Value::as_u64);

    match value.get("type") {
        Some(Value::String(kind)) if !REQUEST_TYPES.contains(&kind.as_str()) => {
            return Err(DecodeError {
                id,
                message: format!("unknown request type: {kind}"),
            });
        }
        Some(Value::String(_)) => {}
        _ => {
            return Err(DecodeError {
                id,
                message: "missing request type".to_string(),
            });
        }
    }
    if id.is_none() {
        return Err(DecodeError {
            id,
            message: "missing or invalid request id".to_string(),
        });
    }

    serde_json::from_value(value).map_err(|e| DecodeError {
        id,
        message: format!("invalid request: {e}"),
    })
}

// ── Results ──────────────────────────────────────────────────────

/// Outcome of `INIT` and `FORCE_RESET`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOutcome {
    pub ready: bool,
    pub schema_version: Option<SchemaVersion>,
    /// Whether the store was wiped on the way.
    pub reset: bool,
}

/// Outcome of `SYNC_SHAPE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub shape_name: String,
    pub table_name: String,
    /// False when the shape was already running.
    pub started: bool,
    /// Rows currently tracked by the shape.
    pub record_count: u64,
}

/// Outcome of `STOP_SHAPE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub shape_name: String,
    pub stopped: bool,
}

/// Outcome of `EXEC`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub changes: u64,
}

/// Outcome of `PING`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    /// Host clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Outcome of `GET_STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub ready: bool,
    pub topology: Topology,
    pub storage_mode: StorageMode,
    pub schema_version: Option<SchemaVersion>,
    /// Running shapes, sorted by name.
    pub active_shapes: Vec<String>,
    /// Registered consumers. Dead consumers are counted until the next
    /// delivery to them fails.
    pub consumers: usize,
    pub capabilities: Capabilities,
    /// The last store-open failure, until the next successful init.
    pub last_error: Option<String>,
}

// ── Replies ──────────────────────────────────────────────────────

/// A reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    InitResult { id: u64, result: InitOutcome },
    SyncShapeResult { id: u64, result: StartOutcome },
    StopShapeResult { id: u64, result: StopOutcome },
    ForceResetResult { id: u64, result: InitOutcome },
    QueryResult { id: u64, result: Vec<Row> },
    ExecResult { id: u64, result: ExecOutcome },
    GetStatusResult { id: u64, result: HostStatus },
    PingResult { id: u64, result: Pong },
    Error { id: Option<u64>, error: String },
}

impl Reply {
    /// The correlation id this reply answers.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::InitResult { id, .. }
            | Self::SyncShapeResult { id, .. }
            | Self::StopShapeResult { id, .. }
            | Self::ForceResetResult { id, .. }
            | Self::QueryResult { id, .. }
            | Self::ExecResult { id, .. }
            | Self::GetStatusResult { id, .. }
            | Self::PingResult { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
        }
    }

    /// The same reply, answering `new_id` instead.
    pub fn with_id(mut self, new_id: u64) -> Self {
        match &mut self {
            Self::InitResult { id, .. }
            | Self::SyncShapeResult { id, .. }
            | Self::StopShapeResult { id, .. }
            | Self::ForceResetResult { id, .. }
            | Self::QueryResult { id, .. }
            | Self::ExecResult { id, .. }
            | Self::GetStatusResult { id, .. }
            | Self::PingResult { id, .. } => *id = new_id,
            Self::Error { id, .. } => *id = Some(new_id),
        }
        self
    }
}

// ── Broadcasts ───────────────────────────────────────────────────

/// Why the local store was wiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    VersionMismatch,
    ManualReset,
}

/// A notification sent to every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Broadcast {
    SchemaReset {
        reason: ResetReason,
        old_version: Option<SchemaVersion>,
        new_version: Option<SchemaVersion>,
    },
    DataChange {
        shape_name: String,
        table_name: String,
        changes: ChangeSet,
    },
    ShapeSynced {
        shape_name: String,
        table_name: String,
        record_count: u64,
    },
    ShapeStopped {
        shape_name: String,
    },
    DbReady {
        schema_version: Option<SchemaVersion>,
    },
    DbError {
        error: String,
    },
}

impl Broadcast {
    /// The shape this broadcast is about, if any.
    pub fn shape_name(&self) -> Option<&str> {
        match self {
            Self::DataChange { shape_name, .. }
            | Self::ShapeSynced { shape_name, .. }
            | Self::ShapeStopped { shape_name } => Some(shape_name.as_str()),
            _ => None,
        }
    }
}

/// Anything the host sends down a consumer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostMessage {
    Reply(Reply),
    Broadcast(Broadcast),
}
