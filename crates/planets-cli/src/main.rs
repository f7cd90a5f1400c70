use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use planets_storage::{PgPlanetStore, PgStoreConfig};
use planets_sync::{SyncConfig, SyncScheduler};
use planets_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "planets-cli")]
#[command(about = "Star Wars planets API with periodic SWAPI sync")]
struct Cli {
    /// Emit logs as JSON lines (also `SWAPI_LOG_JSON=true`).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the sync scheduler.
    Serve {
        /// Overrides `SWAPI_SERVER_PORT`.
        #[arg(long)]
        port: Option<u16>,
        /// Skip the periodic scheduler; manual `/sync` still works.
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Run one sync cycle and exit.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Print the effective configuration.
    Status,
}

fn init_tracing(json: bool) {
    let filter = std::env::var("SWAPI_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn log_json_from_env() -> bool {
    std::env::var("SWAPI_LOG_JSON")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json || log_json_from_env());
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        no_scheduler: false,
    }) {
        Commands::Serve { port, no_scheduler } => {
            serve(&config, port.unwrap_or_else(planets_web::port_from_env), no_scheduler).await?;
        }
        Commands::Sync => {
            let result = planets_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: cycle_id={} fetched={} skipped={} matched={} modified={} upserted={}",
                result.cycle_id, result.fetched, result.skipped, result.matched, result.modified, result.upserted
            );
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgPlanetStore::connect(url, PgStoreConfig::default()).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Status => {
            for (key, value) in config.describe() {
                println!("{key:<26} {value}");
            }
        }
    }

    Ok(())
}

async fn serve(config: &SyncConfig, port: u16, no_scheduler: bool) -> Result<()> {
    let catalog = planets_sync::build_catalog(config)?;
    let store = planets_sync::build_store(config).await?;
    let scheduler: Arc<SyncScheduler> = Arc::new(planets_sync::build_scheduler(config, catalog, store.clone()));

    if config.scheduler_enabled && !no_scheduler {
        scheduler
            .start_schedule(&config.schedule())
            .await
            .context("starting sync scheduler")?;
    } else {
        info!("periodic sync disabled");
    }

    let served = planets_web::serve(AppState::new(scheduler.clone()), port, shutdown_signal()).await;

    scheduler.stop().await;
    store.close().await;
    info!("shutdown complete");
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
