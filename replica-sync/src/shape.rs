//! Shape subscriptions.
//!
//! A shape replicates one server-side result set into one local table. It
//! is seeded by a full fetch and then refreshed on a fixed period: each
//! refresh re-fetches the whole result set, diffs it against the snapshot,
//! writes the difference to the store and broadcasts it.
//!
//! Fetches run in their own tasks and post their result back to the host
//! as a [`Command::Fetched`], so the host keeps serving requests while the
//! remote is slow. Applying a result happens inside the host actor, which
//! keeps store writes serialized. Each subscription has a generation; a
//! tick or fetch result from a stopped or replaced subscription carries an
//! old generation and is ignored. A shape has at most one fetch queued or
//! in flight at a time.

use crate::broadcast::Broadcaster;
use crate::diff::{diff, tracked_rows, Snapshot};
use crate::error::SyncResult;
use crate::host::Command;
use crate::protocol::{Broadcast, HostMessage, Reply, StartOutcome, StopOutcome};
use crate::remote::RemoteSource;
use crate::task::run_blocking;
use replica_db::{create_if_not_exists, LocalStore};
use replica_types::{ChangeSet, ConsumerId, KeySpec, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What a consumer asked to replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub name: String,
    pub table_name: String,
    pub shape_url: String,
    /// DDL that takes priority over the cached and fetched ones.
    pub ddl: Option<String>,
}

/// Where to send the reply to a `SYNC_SHAPE` request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StartWaiter {
    pub consumer: ConsumerId,
    pub id: u64,
}

/// The result of one remote fetch for a shape.
#[derive(Debug)]
pub(crate) struct ShapeFetch {
    /// DDL fetched from the server; only set on the initial fetch of a
    /// shape that had no override and nothing cached.
    pub ddl: Option<String>,
    pub rows: SyncResult<Vec<Row>>,
}

/// Everything applying a fetch needs from the host.
pub(crate) struct ShapeContext<'a> {
    pub store: &'a LocalStore,
    pub key: &'a KeySpec,
    pub broadcaster: &'a mut Broadcaster,
}

struct PendingStart {
    waiter: StartWaiter,
    started: bool,
}

struct ShapeSubscription {
    table_name: String,
    source_url: String,
    snapshot: Snapshot,
    /// False until a full fetch has been written to the store.
    seeded: bool,
    generation: u64,
    /// The table's DDL is being fetched along with the initial rows.
    awaiting_ddl: bool,
    /// Starts waiting on the initial fetch. `None` once it has landed.
    pending_starts: Option<Vec<PendingStart>>,
    /// Set while a fetch is queued or in flight.
    busy: Arc<AtomicBool>,
    ticker: JoinHandle<()>,
}

impl Drop for ShapeSubscription {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

impl ShapeSubscription {
    fn outcome(&self, name: &str, started: bool) -> StartOutcome {
        StartOutcome {
            shape_name: name.to_string(),
            table_name: self.table_name.clone(),
            started,
            record_count: self.snapshot.len() as u64,
        }
    }
}

/// The running shapes of one host.
pub(crate) struct ShapeManager {
    subscriptions: HashMap<String, ShapeSubscription>,
    next_generation: u64,
    refresh_interval: Duration,
    remote: Arc<dyn RemoteSource>,
    commands: mpsc::WeakSender<Command>,
}

impl ShapeManager {
    pub fn new(
        refresh_interval: Duration,
        remote: Arc<dyn RemoteSource>,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_generation: 0,
            refresh_interval,
            remote,
            commands,
        }
    }

    /// Names of the running shapes, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts a shape. Starting a name that is already running is a no-op.
    ///
    /// Returns `None` when the reply goes out later, once the initial fetch
    /// has landed; concurrent starts of one name all wait on that fetch. A
    /// failed initial fetch does not fail the start: the shape keeps
    /// running with an empty snapshot and the first successful refresh
    /// performs the initial sync.
    pub async fn start(
        &mut self,
        ctx: ShapeContext<'_>,
        request: ShapeRequest,
        waiter: StartWaiter,
    ) -> SyncResult<Option<StartOutcome>> {
        if let Some(existing) = self.subscriptions.get_mut(&request.name) {
            debug!("Shape {} already running", request.name);
            if let Some(pending) = existing.pending_starts.as_mut() {
                pending.push(PendingStart {
                    waiter,
                    started: false,
                });
                return Ok(None);
            }
            return Ok(Some(existing.outcome(&request.name, false)));
        }

        let local_ddl = match request.ddl {
            Some(ddl) => Some(ddl),
            None => cached_ddl(ctx.store, &request.table_name).await?,
        };
        let awaiting_ddl = local_ddl.is_none();
        if let Some(ddl) = local_ddl {
            apply_ddl(ctx.store, &ddl).await?;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        // Busy until the initial fetch lands, so ticks skip meanwhile.
        let busy = Arc::new(AtomicBool::new(true));
        let ticker = spawn_ticker(
            request.name.clone(),
            generation,
            self.refresh_interval,
            self.commands.clone(),
            Arc::clone(&busy),
        );
        spawn_fetch(
            Arc::clone(&self.remote),
            self.commands.clone(),
            request.name.clone(),
            generation,
            request.shape_url.clone(),
            awaiting_ddl.then(|| request.table_name.clone()),
        );

        info!(
            "Started shape {} -> {} (generation {})",
            request.name, request.table_name, generation
        );
        self.subscriptions.insert(
            request.name,
            ShapeSubscription {
                table_name: request.table_name,
                source_url: request.shape_url,
                snapshot: Snapshot::new(),
                seeded: false,
                generation,
                awaiting_ddl,
                pending_starts: Some(vec![PendingStart {
                    waiter,
                    started: true,
                }]),
                busy,
                ticker,
            },
        );
        Ok(None)
    }

    /// Starts the fetch for a refresh tick.
    pub fn refresh(&mut self, name: &str, generation: u64) {
        let Some(subscription) = self.subscriptions.get(name) else {
            debug!("Ignoring refresh for stopped shape {}", name);
            return;
        };
        if subscription.generation != generation {
            debug!(
                "Ignoring stale refresh for shape {} (generation {}, current {})",
                name, generation, subscription.generation
            );
            return;
        }
        spawn_fetch(
            Arc::clone(&self.remote),
            self.commands.clone(),
            name.to_string(),
            generation,
            subscription.source_url.clone(),
            None,
        );
    }

    /// Applies a landed fetch. Failures are logged and the shape keeps
    /// running.
    pub async fn fetched(
        &mut self,
        ctx: ShapeContext<'_>,
        name: &str,
        generation: u64,
        fetch: ShapeFetch,
    ) {
        let Some(subscription) = self.subscriptions.get_mut(name) else {
            debug!("Dropping fetch result for stopped shape {}", name);
            return;
        };
        if subscription.generation != generation {
            debug!(
                "Dropping stale fetch result for shape {} (generation {}, current {})",
                name, generation, subscription.generation
            );
            return;
        }

        if subscription.awaiting_ddl {
            subscription.awaiting_ddl = false;
            store_fetched_ddl(ctx.store, &subscription.table_name, fetch.ddl).await;
        }

        match fetch.rows {
            Ok(rows) if !subscription.seeded => {
                let seeded =
                    seed(subscription, name, ctx.store, ctx.key, ctx.broadcaster, rows).await;
                if let Err(e) = seeded {
                    warn!("Initial sync of shape {} failed: {}", name, e);
                }
            }
            Ok(rows) => {
                apply_refresh(subscription, name, ctx.store, ctx.key, ctx.broadcaster, rows).await
            }
            Err(e) => warn!("Fetch for shape {} failed: {}", name, e),
        }
        subscription.busy.store(false, Ordering::Release);

        if let Some(pending) = subscription.pending_starts.take() {
            for start in pending {
                let reply = Reply::SyncShapeResult {
                    id: start.waiter.id,
                    result: subscription.outcome(name, start.started),
                };
                ctx.broadcaster
                    .send_to(&start.waiter.consumer, HostMessage::Reply(reply));
            }
        }
    }

    /// Stops a shape. The local table and its rows are kept.
    ///
    /// Starts still waiting on the initial fetch get an error reply.
    pub fn stop(&mut self, name: &str, broadcaster: &mut Broadcaster) -> StopOutcome {
        let removed = self.subscriptions.remove(name);
        let stopped = removed.is_some();
        if let Some(mut subscription) = removed {
            info!("Stopped shape {}", name);
            for start in subscription.pending_starts.take().unwrap_or_default() {
                let reply = Reply::Error {
                    id: Some(start.waiter.id),
                    error: format!("shape {name} was stopped before its initial sync"),
                };
                broadcaster.send_to(&start.waiter.consumer, HostMessage::Reply(reply));
            }
            broadcaster.broadcast(Broadcast::ShapeStopped {
                shape_name: name.to_string(),
            });
        }
        StopOutcome {
            shape_name: name.to_string(),
            stopped,
        }
    }

    /// Stops every shape.
    pub fn stop_all(&mut self, broadcaster: &mut Broadcaster) {
        for name in self.names() {
            self.stop(&name, broadcaster);
        }
    }
}

/// Writes a full result set to the store and reports it as inserts.
async fn seed(
    subscription: &mut ShapeSubscription,
    name: &str,
    store: &LocalStore,
    key: &KeySpec,
    broadcaster: &mut Broadcaster,
    rows: Vec<Row>,
) -> SyncResult<()> {
    let (rows, dropped) = tracked_rows(rows, key);
    if dropped > 0 {
        warn!(
            "Shape {}: ignoring {} rows without a usable primary key",
            name, dropped
        );
    }

    let writer = store.clone();
    let table = subscription.table_name.clone();
    let batch = rows.clone();
    run_blocking(move || writer.replace_rows(&table, &batch)).await?;

    subscription.snapshot = Snapshot::from_rows(&rows, key);
    subscription.seeded = true;

    let record_count = rows.len() as u64;
    if !rows.is_empty() {
        broadcaster.broadcast(Broadcast::DataChange {
            shape_name: name.to_string(),
            table_name: subscription.table_name.clone(),
            changes: ChangeSet::all_inserted(rows),
        });
    }
    broadcaster.broadcast(Broadcast::ShapeSynced {
        shape_name: name.to_string(),
        table_name: subscription.table_name.clone(),
        record_count,
    });
    info!("Shape {} synced with {} rows", name, record_count);
    Ok(())
}

/// Diffs a refresh against the snapshot, writes and broadcasts the result.
async fn apply_refresh(
    subscription: &mut ShapeSubscription,
    name: &str,
    store: &LocalStore,
    key: &KeySpec,
    broadcaster: &mut Broadcaster,
    rows: Vec<Row>,
) {
    let changes = diff(&subscription.snapshot, &rows, key);
    if changes.is_empty() {
        return;
    }

    let writer = store.clone();
    let table = subscription.table_name.clone();
    let key_spec = key.clone();
    let batch = changes.clone();
    if let Err(e) = run_blocking(move || writer.apply_changes(&table, &key_spec, &batch)).await {
        warn!("Failed to apply changes for shape {}: {}", name, e);
        return;
    }
    subscription.snapshot.apply(&changes, key);

    debug!(
        "Shape {}: {} inserted, {} updated, {} deleted",
        name,
        changes.inserted.len(),
        changes.updated.len(),
        changes.deleted.len()
    );
    broadcaster.broadcast(Broadcast::DataChange {
        shape_name: name.to_string(),
        table_name: subscription.table_name.clone(),
        changes,
    });
}

async fn cached_ddl(store: &LocalStore, table: &str) -> SyncResult<Option<String>> {
    let store = store.clone();
    let name = table.to_string();
    let ddl = run_blocking(move || store.cached_ddl(&name)).await?;
    if ddl.is_some() {
        debug!("Using cached DDL for {}", table);
    }
    Ok(ddl)
}

async fn apply_ddl(store: &LocalStore, ddl: &str) -> SyncResult<()> {
    let store = store.clone();
    let ddl = create_if_not_exists(ddl);
    run_blocking(move || store.exec(&ddl)).await?;
    Ok(())
}

/// Runs and caches DDL that came from the server. Only fetched DDL is
/// cached.
async fn store_fetched_ddl(store: &LocalStore, table: &str, ddl: Option<String>) {
    let Some(ddl) = ddl else {
        warn!("No DDL available for table {}, assuming it already exists", table);
        return;
    };
    if let Err(e) = apply_ddl(store, &ddl).await {
        warn!("Failed to create table {}: {}", table, e);
        return;
    }
    let writer = store.clone();
    let name = table.to_string();
    if let Err(e) = run_blocking(move || writer.cache_ddl(&name, &ddl)).await {
        warn!("Failed to cache DDL for {}: {}", table, e);
    }
}

/// Fetches a shape off the actor and posts the result back to it.
fn spawn_fetch(
    remote: Arc<dyn RemoteSource>,
    commands: mpsc::WeakSender<Command>,
    shape: String,
    generation: u64,
    url: String,
    ddl_table: Option<String>,
) {
    tokio::spawn(async move {
        let ddl = match ddl_table {
            Some(table) => match remote.table_ddl(std::slice::from_ref(&table)).await {
                Ok(mut schemas) => schemas.remove(&table),
                Err(e) => {
                    warn!("Could not fetch DDL for {}: {}", table, e);
                    None
                }
            },
            None => None,
        };
        let rows = remote.fetch_rows(&url).await;

        let Some(commands) = commands.upgrade() else {
            return;
        };
        let fetched = Command::Fetched {
            shape,
            generation,
            fetch: ShapeFetch { ddl, rows },
        };
        if commands.send(fetched).await.is_err() {
            debug!("Host gone before fetch result landed");
        }
    });
}

fn spawn_ticker(
    name: String,
    generation: u64,
    period: Duration,
    commands: mpsc::WeakSender<Command>,
    busy: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the initial fetch covers it.
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(commands) = commands.upgrade() else {
                break;
            };
            if busy.swap(true, Ordering::AcqRel) {
                continue;
            }
            match commands.try_send(Command::Refresh {
                shape: name.clone(),
                generation,
            }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    busy.store(false, Ordering::Release);
                    debug!("Command queue full, skipping refresh of {}", name);
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
    })
}
