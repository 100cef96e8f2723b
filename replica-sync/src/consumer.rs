//! The consumer side of a host channel.
//!
//! A [`Consumer`] sends requests to the host and routes what comes back:
//! replies complete the pending request with the same correlation id,
//! broadcasts fan out to every [`Consumer::subscribe`] receiver. A request
//! that gets no reply within the timeout fails locally; a reply arriving
//! after that is dropped.

use crate::error::{SyncError, SyncResult};
use crate::host::Command;
use crate::protocol::{
    Broadcast, ExecOutcome, HostMessage, HostStatus, InitOutcome, Pong, Reply, Request,
    RequestEnvelope, StartOutcome, StopOutcome,
};
use replica_types::{ConsumerId, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered broadcasts per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection to a sync host.
pub struct Consumer {
    id: ConsumerId,
    commands: mpsc::Sender<Command>,
    enqueue_seq: Arc<AtomicU64>,
    next_id: AtomicU64,
    pending: Pending,
    events: broadcast::Sender<Broadcast>,
    timeout: Duration,
    router: JoinHandle<()>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(
        id: ConsumerId,
        commands: mpsc::Sender<Command>,
        enqueue_seq: Arc<AtomicU64>,
        inbox: mpsc::UnboundedReceiver<HostMessage>,
        timeout: Duration,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let router = tokio::spawn(route(inbox, Arc::clone(&pending), events.clone()));
        Self {
            id,
            commands,
            enqueue_seq,
            next_id: AtomicU64::new(0),
            pending,
            events,
            timeout,
            router,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Resolves once the host has shut down.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    /// Receives every broadcast sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.events.subscribe()
    }

    /// Receives the broadcasts about one shape.
    pub fn watch_shape(&self, shape_name: impl Into<String>) -> ShapeWatcher {
        ShapeWatcher {
            shape_name: shape_name.into(),
            events: self.subscribe(),
        }
    }

    /// Sends a raw request and waits for its reply.
    ///
    /// An `ERROR` reply is returned as a reply, not as an error.
    pub async fn request(&self, request: Request) -> SyncResult<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(id, reply_tx);

        let exchange = async {
            let seq = self.enqueue_seq.fetch_add(1, Ordering::SeqCst) + 1;
            self.commands
                .send(Command::Request {
                    consumer: self.id,
                    seq,
                    envelope: RequestEnvelope { id, request },
                })
                .await
                .map_err(|_| SyncError::ChannelClosed)?;
            reply_rx.await.map_err(|_| SyncError::ChannelClosed)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => {
                lock(&self.pending).remove(&id);
                result
            }
            Err(_) => {
                lock(&self.pending).remove(&id);
                debug!("Request {} from consumer {} timed out", id, self.id);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Opens the store (once per host).
    pub async fn init(&self) -> SyncResult<InitOutcome> {
        match self.request(Request::Init).await? {
            Reply::InitResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Starts replicating `table_name` from `shape_url` under `shape_name`.
    pub async fn start_shape(
        &self,
        shape_name: &str,
        table_name: &str,
        shape_url: &str,
        schema: Option<&str>,
    ) -> SyncResult<StartOutcome> {
        let request = Request::SyncShape {
            shape_name: shape_name.to_string(),
            table_name: table_name.to_string(),
            shape_url: shape_url.to_string(),
            schema: schema.map(str::to_string),
        };
        match self.request(request).await? {
            Reply::SyncShapeResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop_shape(&self, shape_name: &str) -> SyncResult<StopOutcome> {
        let request = Request::StopShape {
            shape_name: shape_name.to_string(),
        };
        match self.request(request).await? {
            Reply::StopShapeResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Wipes the local replica and re-initializes.
    pub async fn force_reset(&self) -> SyncResult<InitOutcome> {
        match self.request(Request::ForceReset).await? {
            Reply::ForceResetResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn query(&self, sql: &str, params: Vec<Value>) -> SyncResult<Vec<Row>> {
        let request = Request::Query {
            sql: sql.to_string(),
            params,
        };
        match self.request(request).await? {
            Reply::QueryResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn exec(&self, sql: &str) -> SyncResult<ExecOutcome> {
        let request = Request::Exec {
            sql: sql.to_string(),
        };
        match self.request(request).await? {
            Reply::ExecResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> SyncResult<HostStatus> {
        match self.request(Request::GetStatus).await? {
            Reply::GetStatusResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> SyncResult<Pong> {
        match self.request(Request::Ping).await? {
            Reply::PingResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.router.abort();
    }
}

fn unexpected(reply: Reply) -> SyncError {
    match reply {
        Reply::Error { error, .. } => SyncError::Host(error),
        other => SyncError::Protocol(format!("unexpected reply: {other:?}")),
    }
}

async fn route(
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
    pending: Pending,
    events: broadcast::Sender<Broadcast>,
) {
    while let Some(message) = inbox.recv().await {
        match message {
            HostMessage::Reply(reply) => {
                let waiter = reply.id().and_then(|id| lock(&pending).remove(&id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!("Discarding reply with no waiting request: {:?}", reply.id()),
                }
            }
            HostMessage::Broadcast(event) => {
                // No subscribers is fine.
                let _ = events.send(event);
            }
        }
    }
    debug!("Consumer channel closed");
}

/// Broadcasts about one shape.
#[derive(Debug)]
pub struct ShapeWatcher {
    shape_name: String,
    events: broadcast::Receiver<Broadcast>,
}

impl ShapeWatcher {
    pub fn shape_name(&self) -> &str {
        &self.shape_name
    }

    /// The next broadcast about the shape; `None` once the consumer is gone.
    pub async fn next(&mut self) -> Option<Broadcast> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.shape_name() == Some(self.shape_name.as_str()) => {
                    return Some(event)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Watcher for shape {} lagged, {} broadcasts skipped",
                        self.shape_name, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
