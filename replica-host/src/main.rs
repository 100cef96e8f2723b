//! Replica sync host.
//!
//! Runs a sync host against a remote source and serves it over HTTP to
//! consumers in other processes.
//!
//! Usage:
//!   replica-host --server-url https://sync.example.com --data-dir ./replica \
//!       --shape todos=todo=/shapes/todos

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use replica_host::{build_router, AppState, ShapeSpec};
use replica_sync::{start_host, HttpRemote, SyncConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "replica-host")]
#[command(about = "Replica sync host")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the local store and schema fingerprint
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Base URL of the remote source
    #[arg(short, long)]
    server_url: Option<String>,

    /// Shape refresh period in milliseconds
    #[arg(long)]
    refresh_interval_ms: Option<u64>,

    /// HTTP API port
    #[arg(long, default_value = "4010")]
    http_port: u16,

    /// Shape to start on launch, as name=table=url (repeatable)
    #[arg(long = "shape")]
    shapes: Vec<ShapeSpec>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn sync_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SyncConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(url) = &self.server_url {
            config.server_url = url.clone();
        }
        if let Some(ms) = self.refresh_interval_ms {
            config.refresh_interval_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Replica host starting...");
    let config = args.sync_config()?;
    let remote = Arc::new(HttpRemote::from_config(&config).context("creating remote client")?);
    let host = start_host(config.clone(), remote)
        .await
        .context("starting sync host")?;

    let state = AppState::new(Arc::clone(&host))
        .await
        .context("connecting API consumer")?;

    match state.rpc().init().await {
        Ok(outcome) => info!(
            "Store ready (schema {}, reset: {})",
            outcome
                .schema_version
                .as_ref()
                .map_or("unknown", |v| v.as_str()),
            outcome.reset
        ),
        // Status keeps reporting the failure; a later INIT retries.
        Err(e) => error!("Initial store setup failed: {}", e),
    }

    for shape in &args.shapes {
        match state
            .rpc()
            .start_shape(&shape.name, &shape.table, &shape.url, None)
            .await
        {
            Ok(outcome) => info!(
                "Shape {} -> {} started ({} rows)",
                outcome.shape_name, outcome.table_name, outcome.record_count
            ),
            Err(e) => warn!("Failed to start shape {}: {}", shape.name, e),
        }
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .with_context(|| format!("binding HTTP port {}", args.http_port))?;

    println!("\n========================================");
    println!("  Replica Host Running");
    println!("========================================");
    println!("  Topology:  {}", host.topology());
    println!("  Data dir:  {}", config.data_dir.display());
    println!("  Remote:    {}", config.server_url);
    println!("  HTTP Port: {}", args.http_port);
    println!("========================================\n");

    let shutdown_host = Arc::clone(&host);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
            // Ends the open event streams so the server can drain.
            if let Err(e) = shutdown_host.shutdown().await {
                warn!("Sync host shutdown failed: {}", e);
            }
        })
        .await
        .context("HTTP server failed")?;

    info!("Replica host stopped");
    Ok(())
}
