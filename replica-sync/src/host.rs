//! The sync host actor.
//!
//! One task owns all host state: the store handle, the running shapes, the
//! consumer registry and the schema fingerprint. Everything else talks to
//! it through a bounded command queue, so every state change and every
//! store write happens in queue order. Remote shape fetches run outside the
//! actor; their results come back through the same queue.
//!
//! An explicit `INIT` on an open store re-checks the server fingerprint and
//! resets the replica if it changed while the host was running. Lazy
//! initialization by `QUERY`/`EXEC` only happens when no store is open.
//!
//! The actor exits on `Shutdown`, or once every [`HostHandle`] and every
//! [`Consumer`] of it has been dropped.

use crate::broadcast::Broadcaster;
use crate::config::SyncConfig;
use crate::consumer::Consumer;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    Broadcast, ExecOutcome, HostMessage, HostStatus, InitOutcome, Pong, Reply, Request,
    RequestEnvelope, StartOutcome,
};
use crate::remote::RemoteSource;
use crate::schema_guard::SchemaGuard;
use crate::shape::{ShapeContext, ShapeFetch, ShapeManager, ShapeRequest, StartWaiter};
use crate::task::run_blocking;
use replica_db::{FileFingerprintSlot, FingerprintSlot, LocalStore, MemoryFingerprintSlot};
use replica_types::{Capabilities, ConsumerId, SchemaVersion, StorageMode, Topology};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commands processed by the host actor.
pub(crate) enum Command {
    /// Register a consumer's inbound channel.
    Connect {
        id: ConsumerId,
        outbox: mpsc::UnboundedSender<HostMessage>,
        reply: oneshot::Sender<()>,
    },
    /// A consumer request. `seq` is the host-wide enqueue sequence number.
    Request {
        consumer: ConsumerId,
        seq: u64,
        envelope: RequestEnvelope,
    },
    /// Refresh tick for a shape.
    Refresh { shape: String, generation: u64 },
    /// A shape fetch finished.
    Fetched {
        shape: String,
        generation: u64,
        fetch: ShapeFetch,
    },
    /// Stop every shape, close the store and exit.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to a running host actor.
#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::Sender<Command>,
    enqueue_seq: Arc<AtomicU64>,
    request_timeout: Duration,
    topology: Topology,
    storage_mode: StorageMode,
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("topology", &self.topology)
            .field("storage_mode", &self.storage_mode)
            .finish()
    }
}

impl HostHandle {
    /// Spawns a host actor on the current runtime.
    ///
    /// The store is not opened until the first `INIT` (or a request that
    /// needs it).
    pub fn spawn(
        config: SyncConfig,
        remote: Arc<dyn RemoteSource>,
        capabilities: Capabilities,
        topology: Topology,
    ) -> SyncResult<(Self, JoinHandle<()>)> {
        config.validate()?;
        let storage_mode = config.storage.resolve(&capabilities);
        let (commands, command_rx) = mpsc::channel(config.command_queue);
        let enqueue_seq = Arc::new(AtomicU64::new(0));

        let slot: Arc<dyn FingerprintSlot> = match storage_mode {
            StorageMode::Memory => Arc::new(MemoryFingerprintSlot::new()),
            _ => Arc::new(FileFingerprintSlot::in_dir(&config.data_dir)),
        };
        let guard = SchemaGuard::new(
            Arc::clone(&remote),
            slot,
            config.location(),
            storage_mode,
        );

        let actor = HostActor {
            shapes: ShapeManager::new(config.refresh_interval(), remote, commands.downgrade()),
            broadcaster: Broadcaster::new(),
            store: None,
            schema_version: None,
            last_init: None,
            last_error: None,
            enqueue_seq: Arc::clone(&enqueue_seq),
            guard,
            capabilities,
            topology,
            storage_mode,
            config: config.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx));

        info!(
            "Sync host started ({} topology, {} storage, data dir {})",
            topology,
            storage_mode,
            config.data_dir.display()
        );
        let handle = Self {
            commands,
            enqueue_seq,
            request_timeout: config.request_timeout(),
            topology,
            storage_mode,
        };
        Ok((handle, task))
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    /// Registers a new consumer.
    pub async fn connect(&self) -> SyncResult<Consumer> {
        let id = ConsumerId::new();
        let (outbox, inbox) = mpsc::unbounded_channel();
        let (reply, registered) = oneshot::channel();
        self.commands
            .send(Command::Connect { id, outbox, reply })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        registered.await.map_err(|_| SyncError::ChannelClosed)?;

        Ok(Consumer::new(
            id,
            self.commands.clone(),
            Arc::clone(&self.enqueue_seq),
            inbox,
            self.request_timeout,
        ))
    }

    /// Stops the actor. Consumers get `ChannelClosed` afterwards.
    pub async fn shutdown(&self) -> SyncResult<()> {
        request_shutdown(&self.commands).await
    }

    /// A reference to the actor's queue that does not keep it alive.
    pub(crate) fn downgrade(&self) -> mpsc::WeakSender<Command> {
        self.commands.downgrade()
    }
}

/// Asks the actor behind `commands` to stop and waits until it has.
pub(crate) async fn request_shutdown(commands: &mpsc::Sender<Command>) -> SyncResult<()> {
    let (reply, done) = oneshot::channel();
    if commands.send(Command::Shutdown { reply }).await.is_err() {
        // Already gone.
        return Ok(());
    }
    done.await.map_err(|_| SyncError::ChannelClosed)
}

struct HostActor {
    config: SyncConfig,
    guard: SchemaGuard,
    capabilities: Capabilities,
    topology: Topology,
    storage_mode: StorageMode,
    store: Option<LocalStore>,
    schema_version: Option<SchemaVersion>,
    shapes: ShapeManager,
    broadcaster: Broadcaster,
    enqueue_seq: Arc<AtomicU64>,
    /// Sequence watermark and outcome of the last finished init attempt.
    /// Requests enqueued at or below the watermark share that outcome.
    last_init: Option<(u64, Result<InitOutcome, String>)>,
    last_error: Option<String>,
}

impl HostActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut stopped_by = None;
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect { id, outbox, reply } => {
                    self.broadcaster.register(id, outbox);
                    let _ = reply.send(());
                }
                Command::Request {
                    consumer,
                    seq,
                    envelope,
                } => {
                    // `None` means the reply goes out later.
                    if let Some(reply) = self.handle_request(consumer, seq, envelope).await {
                        self.broadcaster.send_to(&consumer, HostMessage::Reply(reply));
                    }
                }
                Command::Refresh { shape, generation } => {
                    self.shapes.refresh(&shape, generation);
                }
                Command::Fetched {
                    shape,
                    generation,
                    fetch,
                } => {
                    let Some(store) = self.store.clone() else {
                        debug!("Dropping fetch result for {}, store is closed", shape);
                        continue;
                    };
                    let ctx = ShapeContext {
                        store: &store,
                        key: &self.config.primary_key,
                        broadcaster: &mut self.broadcaster,
                    };
                    self.shapes.fetched(ctx, &shape, generation, fetch).await;
                }
                Command::Shutdown { reply } => {
                    stopped_by = Some(reply);
                    break;
                }
            }
        }

        // Later requests fail with `ChannelClosed` instead of queueing.
        commands.close();
        if stopped_by.is_none() {
            debug!("Every handle to the sync host was dropped");
        }
        self.shutdown().await;
        if let Some(reply) = stopped_by {
            let _ = reply.send(());
        }
        debug!("Sync host actor exited");
    }

    async fn handle_request(
        &mut self,
        consumer: ConsumerId,
        seq: u64,
        envelope: RequestEnvelope,
    ) -> Option<Reply> {
        let id = envelope.id;
        let kind = envelope.request.kind();
        let result = match envelope.request {
            Request::Init => self
                .init(seq)
                .await
                .map(|result| Reply::InitResult { id, result }),
            Request::SyncShape {
                shape_name,
                table_name,
                shape_url,
                schema,
            } => {
                let request = ShapeRequest {
                    name: shape_name,
                    table_name,
                    shape_url,
                    ddl: schema,
                };
                let waiter = StartWaiter { consumer, id };
                match self.start_shape(seq, request, waiter).await {
                    Ok(Some(result)) => Ok(Reply::SyncShapeResult { id, result }),
                    Ok(None) => return None,
                    Err(e) => Err(e),
                }
            }
            Request::StopShape { shape_name } => Ok(Reply::StopShapeResult {
                id,
                result: self.shapes.stop(&shape_name, &mut self.broadcaster),
            }),
            Request::ForceReset => self
                .force_reset()
                .await
                .map(|result| Reply::ForceResetResult { id, result }),
            Request::Query { sql, params } => {
                match self.ensure_ready(seq).await {
                    Ok(store) => run_blocking(move || store.query(&sql, &params))
                        .await
                        .map(|result| Reply::QueryResult { id, result }),
                    Err(e) => Err(e),
                }
            }
            Request::Exec { sql } => match self.ensure_ready(seq).await {
                Ok(store) => run_blocking(move || store.exec(&sql))
                    .await
                    .map(|changes| Reply::ExecResult {
                        id,
                        result: ExecOutcome { changes },
                    }),
                Err(e) => Err(e),
            },
            Request::GetStatus => Ok(Reply::GetStatusResult {
                id,
                result: self.status(),
            }),
            Request::Ping => Ok(Reply::PingResult {
                id,
                result: Pong {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
            }),
        };

        Some(result.unwrap_or_else(|e| {
            debug!("{} request {} failed: {}", kind, id, e);
            Reply::Error {
                id: Some(id),
                error: e.to_string(),
            }
        }))
    }

    /// Opens the store once. Requests enqueued while an attempt ran get
    /// that attempt's outcome instead of starting another one.
    async fn init(&mut self, seq: u64) -> SyncResult<InitOutcome> {
        if let Some((watermark, outcome)) = &self.last_init {
            if seq <= *watermark {
                return outcome.clone().map_err(SyncError::Host);
            }
        }
        if self.store.is_some() {
            match self.guard.server_version().await {
                Some(server) if self.schema_version.as_ref() != Some(&server) => {
                    info!(
                        "Server schema changed to {} while running, resetting replica",
                        server
                    );
                    self.shapes.stop_all(&mut self.broadcaster);
                }
                _ => return Ok(self.ready_outcome(false)),
            }
        }

        let result = self.run_init(false).await;
        self.record_init(&result);
        result
    }

    fn record_init(&mut self, result: &SyncResult<InitOutcome>) {
        let watermark = self.enqueue_seq.load(Ordering::SeqCst);
        let outcome = match result {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(e.to_string()),
        };
        self.last_init = Some((watermark, outcome));
    }

    fn ready_outcome(&self, reset: bool) -> InitOutcome {
        InitOutcome {
            ready: self.store.is_some(),
            schema_version: self.schema_version.clone(),
            reset,
        }
    }

    /// Reconciles the fingerprint and opens the store.
    ///
    /// After a manual reset the store is already wiped; the server version
    /// is adopted as is and no second `SCHEMA_RESET` goes out.
    async fn run_init(&mut self, after_manual_reset: bool) -> SyncResult<InitOutcome> {
        let (reset, server_version) = if after_manual_reset {
            (true, self.guard.server_version().await)
        } else {
            let reconciliation = self
                .guard
                .check_and_reconcile(&mut self.store, &mut self.broadcaster)
                .await?;
            (reconciliation.reset, reconciliation.new_version)
        };

        let location = self.config.location();
        let mode = self.storage_mode;
        let store = match run_blocking(move || LocalStore::open(&location, mode)).await {
            Ok(store) => store,
            Err(e) => {
                let message = e.to_string();
                error!("Failed to open local store: {}", message);
                self.last_error = Some(message.clone());
                self.broadcaster.broadcast(Broadcast::DbError { error: message });
                return Err(e);
            }
        };

        let schema_version = match server_version {
            Some(version) => {
                if reset {
                    self.guard.commit(&version).await?;
                }
                Some(version)
            }
            None => self.guard.persisted_version().await?,
        };

        self.store = Some(store);
        self.schema_version = schema_version.clone();
        self.last_error = None;
        info!(
            "Local store ready (schema {})",
            schema_version.as_ref().map_or("unknown", SchemaVersion::as_str)
        );
        self.broadcaster.broadcast(Broadcast::DbReady {
            schema_version: schema_version.clone(),
        });

        Ok(InitOutcome {
            ready: true,
            schema_version,
            reset,
        })
    }

    async fn ensure_ready(&mut self, seq: u64) -> SyncResult<LocalStore> {
        if self.store.is_none() {
            self.init(seq).await?;
        }
        self.store
            .clone()
            .ok_or_else(|| SyncError::NotReady("local store is not open".into()))
    }

    async fn start_shape(
        &mut self,
        seq: u64,
        request: ShapeRequest,
        waiter: StartWaiter,
    ) -> SyncResult<Option<StartOutcome>> {
        let store = self.ensure_ready(seq).await?;
        let ctx = ShapeContext {
            store: &store,
            key: &self.config.primary_key,
            broadcaster: &mut self.broadcaster,
        };
        self.shapes.start(ctx, request, waiter).await
    }

    /// Stop all shapes, wipe, re-init.
    async fn force_reset(&mut self) -> SyncResult<InitOutcome> {
        info!("Force reset requested");
        self.shapes.stop_all(&mut self.broadcaster);
        self.schema_version = None;

        let result = match self
            .guard
            .manual_reset(&mut self.store, &mut self.broadcaster)
            .await
        {
            Ok(()) => self.run_init(true).await,
            Err(e) => {
                warn!("Force reset failed to wipe the store: {}", e);
                Err(e)
            }
        };
        self.record_init(&result);
        result
    }

    fn status(&self) -> HostStatus {
        HostStatus {
            ready: self.store.is_some(),
            topology: self.topology,
            storage_mode: self.storage_mode,
            schema_version: self.schema_version.clone(),
            active_shapes: self.shapes.names(),
            consumers: self.broadcaster.len(),
            capabilities: self.capabilities,
            last_error: self.last_error.clone(),
        }
    }

    async fn shutdown(&mut self) {
        self.shapes.stop_all(&mut self.broadcaster);
        if let Some(store) = self.store.take() {
            if let Err(e) = run_blocking(move || store.close()).await {
                warn!("Failed to close local store: {}", e);
            }
        }
        info!("Sync host stopped");
    }
}
