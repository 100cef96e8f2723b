//! HTTP API for the Replica sync host.
//!
//! Lets consumers in other processes use a host:
//!
//! - `GET /api/v1/status`: the host status
//! - `POST /api/v1/rpc`: one request envelope in, one reply envelope out
//! - `GET /api/v1/events`: broadcasts as server-sent events
//!
//! Requests and event streams all go through one consumer, so under a
//! per-consumer topology the events come from the same private host that
//! runs the RPC requests.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream};
use replica_sync::{decode_request, Consumer, Reply, SyncError, SyncHost};
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Shared state of the HTTP API.
#[derive(Clone)]
pub struct AppState {
    host: Arc<dyn SyncHost>,
    /// Consumer that carries RPC and status requests and feeds the event
    /// streams.
    rpc: Arc<Consumer>,
}

impl AppState {
    /// Connects the RPC consumer.
    pub async fn new(host: Arc<dyn SyncHost>) -> Result<Self, SyncError> {
        let rpc = Arc::new(host.connect().await?);
        Ok(Self { host, rpc })
    }

    pub fn host(&self) -> &Arc<dyn SyncHost> {
        &self.host
    }

    pub fn rpc(&self) -> &Consumer {
        &self.rpc
    }
}

/// A shape to start when the host comes up, given as `name=table=url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeSpec {
    pub name: String,
    pub table: String,
    pub url: String,
}

impl FromStr for ShapeSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(table), Some(url))
                if !name.is_empty() && !table.is_empty() && !url.is_empty() =>
            {
                Ok(Self {
                    name: name.to_string(),
                    table: table.to_string(),
                    url: url.to_string(),
                })
            }
            _ => Err(format!("expected name=table=url, got '{s}'")),
        }
    }
}

fn error_response(status: StatusCode, reply: Reply) -> Response {
    (status, Json(reply)).into_response()
}

async fn status_handler(State(state): State<AppState>) -> Response {
    match state.rpc.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            Reply::Error {
                id: None,
                error: e.to_string(),
            },
        ),
    }
}

async fn rpc_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let text = String::from_utf8_lossy(&body);
    let envelope = match decode_request(&text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Rejected RPC request: {}", e);
            return error_response(StatusCode::BAD_REQUEST, e.into_reply());
        }
    };

    let id = envelope.id;
    match state.rpc.request(envelope.request).await {
        Ok(reply) => Json(reply.with_id(id)).into_response(),
        Err(e) => {
            let status = match e {
                SyncError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(
                status,
                Reply::Error {
                    id: Some(id),
                    error: e.to_string(),
                },
            )
        }
    }
}

async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Event stream opened");
    let events = state.rpc.subscribe();

    // The stream ends with the host.
    let stream = stream::unfold((state.rpc, events), |(rpc, mut events)| async move {
        loop {
            let received = tokio::select! {
                received = events.recv() => received,
                _ = rpc.closed() => return None,
            };
            match received {
                Ok(broadcast) => {
                    let event = match Event::default().json_data(&broadcast) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Failed to encode broadcast: {}", e);
                            continue;
                        }
                    };
                    return Some((Ok(event), (rpc, events)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, {} broadcasts skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Builds the HTTP API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/rpc", post(rpc_handler))
        .route("/api/v1/events", get(events_handler))
        .with_state(state)
}
