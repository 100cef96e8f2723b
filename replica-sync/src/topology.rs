//! Host topologies.
//!
//! A shared host runs one actor and one store for every consumer. When the
//! runtime cannot serve many consumers from one host, each consumer gets a
//! private host with its own store under `<data_dir>/consumers/<n>`. That
//! fallback fetches every shape once per consumer; status reports which
//! topology is in use. A private host lives as long as its consumer.

use crate::capabilities;
use crate::config::SyncConfig;
use crate::consumer::Consumer;
use crate::error::SyncResult;
use crate::host::{request_shutdown, Command, HostHandle};
use crate::remote::RemoteSource;
use async_trait::async_trait;
use replica_types::{Capabilities, Topology};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Something consumers can connect to.
#[async_trait]
pub trait SyncHost: Send + Sync {
    fn topology(&self) -> Topology;

    fn capabilities(&self) -> Capabilities;

    /// Opens a new consumer channel.
    async fn connect(&self) -> SyncResult<Consumer>;

    /// Stops every host actor behind this handle.
    async fn shutdown(&self) -> SyncResult<()>;
}

/// One host shared by every consumer.
#[derive(Debug)]
pub struct SharedHost {
    handle: HostHandle,
    capabilities: Capabilities,
}

impl SharedHost {
    pub fn spawn(
        config: SyncConfig,
        remote: Arc<dyn RemoteSource>,
        capabilities: Capabilities,
    ) -> SyncResult<Self> {
        let (handle, _task) = HostHandle::spawn(config, remote, capabilities, Topology::Shared)?;
        Ok(Self {
            handle,
            capabilities,
        })
    }

    pub fn handle(&self) -> &HostHandle {
        &self.handle
    }
}

#[async_trait]
impl SyncHost for SharedHost {
    fn topology(&self) -> Topology {
        Topology::Shared
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&self) -> SyncResult<Consumer> {
        self.handle.connect().await
    }

    async fn shutdown(&self) -> SyncResult<()> {
        self.handle.shutdown().await
    }
}

/// A private host per consumer.
pub struct PerConsumerHost {
    config: SyncConfig,
    remote: Arc<dyn RemoteSource>,
    capabilities: Capabilities,
    next_index: AtomicU64,
    /// Queues of the private hosts. Only the consumers hold them open.
    hosts: Mutex<Vec<mpsc::WeakSender<Command>>>,
}

impl PerConsumerHost {
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteSource>,
        capabilities: Capabilities,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            remote,
            capabilities,
            next_index: AtomicU64::new(0),
            hosts: Mutex::new(Vec::new()),
        })
    }

    /// Number of private hosts whose consumer is still connected.
    pub fn host_count(&self) -> usize {
        let mut hosts = self.hosts();
        hosts.retain(|host| host.upgrade().is_some());
        hosts.len()
    }

    fn hosts(&self) -> MutexGuard<'_, Vec<mpsc::WeakSender<Command>>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SyncHost for PerConsumerHost {
    fn topology(&self) -> Topology {
        Topology::PerConsumer
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&self) -> SyncResult<Consumer> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let config = self.config.for_consumer(index);
        let (handle, _task) = HostHandle::spawn(
            config,
            Arc::clone(&self.remote),
            self.capabilities,
            Topology::PerConsumer,
        )?;
        let consumer = handle.connect().await?;

        // The handle is dropped here, so the consumer is the only thing
        // keeping the private host running.
        let mut hosts = self.hosts();
        hosts.retain(|host| host.upgrade().is_some());
        hosts.push(handle.downgrade());
        Ok(consumer)
    }

    async fn shutdown(&self) -> SyncResult<()> {
        let hosts: Vec<mpsc::Sender<Command>> = self
            .hosts()
            .drain(..)
            .filter_map(|host| host.upgrade())
            .collect();
        for host in hosts {
            if let Err(e) = request_shutdown(&host).await {
                warn!("Failed to stop per-consumer host: {}", e);
            }
        }
        Ok(())
    }
}

/// Builds the host the configuration and capabilities call for.
pub fn select_host(
    config: SyncConfig,
    remote: Arc<dyn RemoteSource>,
    capabilities: Capabilities,
) -> SyncResult<Arc<dyn SyncHost>> {
    let topology = config.topology.resolve(&capabilities);
    info!("Selected {} host topology", topology);
    match topology {
        Topology::Shared => Ok(Arc::new(SharedHost::spawn(config, remote, capabilities)?)),
        Topology::PerConsumer => Ok(Arc::new(PerConsumerHost::new(config, remote, capabilities)?)),
    }
}

/// Detects capabilities, then builds the host.
pub async fn start_host(
    config: SyncConfig,
    remote: Arc<dyn RemoteSource>,
) -> SyncResult<Arc<dyn SyncHost>> {
    let capabilities = capabilities::detect(config.data_dir.clone()).await;
    select_host(config, remote, capabilities)
}
