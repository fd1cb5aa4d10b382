//! gpusched daemon
//!
//! Runs the dispatcher loop and serves the REST API for a single GPU node.

mod shutdown;

use anyhow::Context;
use clap::Parser;
use gpusched_api::create_router;
use gpusched_core::{detect_monitor, DaemonConfig, LoggingConfig};
use gpusched_runtime::{ProcessRunner, ProcessRunnerConfig};
use gpusched_scheduler::{Dispatcher, PriorityEngine};
use gpusched_store::{JobStore, StoreLayout};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::shutdown::install_shutdown_handler;

/// gpusched daemon - single-node GPU job scheduler
#[derive(Parser, Debug)]
#[command(name = "gpuschedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Directory for job records, scripts and logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the configuration file and apply command-line overrides
    fn into_config(self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(address) = self.address {
            config.api.address = address;
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.storage.data_dir = data_dir;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// RUST_LOG takes precedence over the configured level
fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match config.format.as_str() {
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(&config.logging);

    info!("Starting gpusched daemon v{}", env!("CARGO_PKG_VERSION"));

    // Restore jobs from the previous run
    let layout = StoreLayout::new(&config.storage.data_dir);
    let store = Arc::new(
        JobStore::open(layout)
            .await
            .context("opening job store")?,
    );
    let orphans = store.recover_orphans().await?;
    if !orphans.is_empty() {
        warn!(count = orphans.len(), "Marked jobs orphaned by restart as failed");
    }

    let monitor = detect_monitor(&config.gpu);
    let runner = Arc::new(ProcessRunner::new(
        ProcessRunnerConfig::from(&config.runtime),
        store.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        monitor,
        runner,
        PriorityEngine::new(config.priority.clone()),
        Duration::from_millis(config.scheduler.tick_interval_ms),
    ));

    let shutdown = install_shutdown_handler().context("installing signal handlers")?;
    let dispatcher_task = tokio::spawn(dispatcher.clone().run(shutdown.clone()));

    let router = create_router(dispatcher);
    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(
        address = %addr,
        data_dir = %config.storage.data_dir.display(),
        "API server listening"
    );

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("API server error")?;

    // The server can also stop on its own; make sure the dispatcher follows
    shutdown.cancel();
    dispatcher_task.await?;

    info!("gpusched daemon stopped");
    Ok(())
}
