//! Media job server binary
//!
//! Run with: cargo run -p mediaflow --bin mediaflow-server -- --config mediaflow.toml

use clap::Parser;
use mediaflow::{
    server::MediaServer, AppConfig, Coordinator, MediaStore, Tooling,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mediaflow-server", version, about = "Media job orchestration server")]
struct Args {
    /// TOML config file (falls back to MEDIAFLOW_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the database path
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediaflow=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = AppConfig::resolve(args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Database: {}", config.storage.db_path.display());
    tracing::info!("  - Temp dir: {}", config.storage.temp_dir.display());
    tracing::info!("  - Downloader: {}", config.download.tool_path);
    tracing::info!("  - Analyzer: {}", config.analysis.command);

    let store = MediaStore::open(&config.storage.db_path)?;
    let tooling = Tooling::from_config(&config)?;
    let (coordinator, supervisor) = Coordinator::launch(config, store, tooling).await?;

    let server = MediaServer::new(coordinator.clone());
    tracing::info!("Health: http://{}/health", server.address());

    tokio::select! {
        served = server.start() => served?,
        workers = supervisor.wait() => {
            // A worker stopped; exit so the next start recovers interrupted jobs
            workers?;
            tracing::warn!("Workers stopped, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            coordinator.shutdown();
        }
    }

    Ok(())
}
