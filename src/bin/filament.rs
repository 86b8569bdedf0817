//! Main entry point for the filament worker.
//!
//! Connects to the orchestrator with configuration from environment
//! variables and serves until Ctrl+C.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filament::{Config, Worker};

#[derive(Parser, Debug)]
#[command(name = "filament", version, about = "Workflow worker daemon")]
struct Args {
    /// Override the number of concurrent sandbox slots
    #[arg(long)]
    capacity: Option<usize>,

    /// Override the adaptor repo directory
    #[arg(long)]
    repo_dir: Option<PathBuf>,

    /// Override the sandbox executable path
    #[arg(long)]
    sandbox_bin: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(repo_dir) = args.repo_dir {
        config.repo_dir = repo_dir;
    }
    if let Some(sandbox_bin) = args.sandbox_bin {
        config.sandbox_bin = sandbox_bin;
    }

    info!(
        url = %config.orchestrator_url,
        capacity = config.capacity,
        "starting filament worker"
    );

    let worker = Worker::connect(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    worker.serve(shutdown_rx).await
}
