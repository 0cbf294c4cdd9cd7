//! # Stream Ingest Main Entry Point

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use stream_ingest::{
    clock::SystemClock,
    config::{AppConfig, ConfigLoader, KvBackend},
    db::{health_check, init_pool},
    kv::{KvStore, MemoryKv, SqlKv},
    server::{AppState, run_server},
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const COMPACTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "stream-ingest", version, about = "HTTP event ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run migrations and serve the API (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("cannot load configuration")?;
    init_tracing(&config)?;
    tracing::info!(profile = %config.profile, "loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "effective configuration");
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate => migrate(&config).await,
    }
}

async fn migrate(config: &AppConfig) -> Result<()> {
    let db = init_pool(&config.kv).await?;
    Migrator::up(&db, None).await.context("cannot apply migrations")?;
    tracing::info!("migrations applied");
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let background = TaskTracker::new();
    let cancel = CancellationToken::new();

    let kv: Arc<dyn KvStore> = match config.kv.backend {
        KvBackend::Memory => {
            tracing::warn!("using the in-memory kv store, definitions are lost on restart");
            Arc::new(MemoryKv::new())
        }
        KvBackend::Sql => {
            let db = init_pool(&config.kv).await?;
            health_check(&db).await?;
            Migrator::up(&db, None).await.context("cannot apply migrations")?;
            let kv = SqlKv::new(
                db,
                config.kv.watch_poll_interval(),
                config.kv.change_retention,
            );
            kv.spawn_compaction(COMPACTION_INTERVAL, cancel.clone(), &background);
            Arc::new(kv)
        }
    };

    let state = AppState::start(Arc::clone(&config), kv, Arc::new(SystemClock))
        .await
        .context("cannot start the ingestion pipeline")?;

    let served = run_server(state.clone(), shutdown_signal()).await;

    state.shutdown().await;
    cancel.cancel();
    background.close();
    background.wait().await;
    tracing::info!("shutdown complete");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
