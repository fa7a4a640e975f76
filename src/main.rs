//! Catalog sync service entry point.
//!
//! Runs the maintenance scheduler with its admin interface, or a single
//! maintenance operation from the command line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use catalog_sync::{
    artifacts,
    config::SyncConfig,
    logging::LoggingArgs,
    manager::MaintenanceOrchestrator,
    registry::TriggerOutcome,
    store::PgCatalogStore,
    web::AdminWebService,
};

/// Command-line arguments for the catalog sync service
#[derive(Debug, Parser)]
#[command(
    name = "catalog-sync",
    version,
    about = "Keep a book catalog in sync with its distribution archives"
)]
struct Args {
    /// Path to JSON configuration file
    #[arg(short, long, env = "CATALOG_SYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler and the admin interface until interrupted
    Serve {
        /// Bind address for the admin interface
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Run one scheduled task now
    RunTask {
        /// Task name
        name: String,
    },
    /// Download the SQL dumps and import them
    DownloadSql,
    /// Download the cover archives
    DownloadCovers,
    /// Download new daily delta archives
    UpdateDaily,
    /// Rebuild the archive mapping table
    UpdateZipMappings,
    /// Create filename records for items lacking one
    CreateMissingFilenames,
    /// Refresh full-text search vectors
    UpdateSearchVectors,
    /// Check catalog consistency; exits with status 1 when unhealthy
    HealthCheck,
    /// Print catalog statistics
    Stats,
}

impl Command {
    /// Whether the command reads or writes the catalog database.
    fn uses_catalog(&self) -> bool {
        !matches!(self, Command::DownloadCovers | Command::UpdateDaily)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_orchestrator(
    config: SyncConfig,
    uses_catalog: bool,
) -> Result<MaintenanceOrchestrator> {
    let store = if uses_catalog {
        let store = PgCatalogStore::connect(&config.database, &config.search_refresh_statement)
            .await
            .context("Failed to connect to catalog database")?;
        store
            .ensure_schema()
            .await
            .context("Failed to prepare archive mapping table")?;
        store
    } else {
        PgCatalogStore::connect_lazy(&config.database, &config.search_refresh_statement)
            .context("Invalid catalog database URL")?
    };

    let fetcher = artifacts::from_config(&config.origin).context("Failed to set up artifact origin")?;

    Ok(MaintenanceOrchestrator::new(config, Arc::new(store), fetcher)?)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    args.logging.init();

    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }

    let orchestrator = build_orchestrator(config, args.command.uses_catalog()).await?;

    match args.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| orchestrator.config().server.bind_address.clone());
            orchestrator.start().await?;

            let result = AdminWebService::new(orchestrator.clone())
                .serve(&bind, shutdown_signal())
                .await;
            orchestrator.stop().await;
            result?;
        }
        Command::RunTask { name } => {
            orchestrator.register_tasks().await?;
            match orchestrator.run_now(&name).await? {
                TriggerOutcome::Completed => info!("Task {} completed", name),
                TriggerOutcome::Skipped => warn!("Task {} already running", name),
                TriggerOutcome::Failed(e) => {
                    eprintln!("Task {} failed: {}", name, e);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::DownloadSql => print_json(&orchestrator.download_sql().await?)?,
        Command::DownloadCovers => print_json(&orchestrator.download_covers().await?)?,
        Command::UpdateDaily => print_json(&orchestrator.update_daily().await?)?,
        Command::UpdateZipMappings => print_json(&orchestrator.update_zip_mappings().await?)?,
        Command::CreateMissingFilenames => {
            let created = orchestrator.create_missing_filenames().await?;
            println!("Created {} filename record(s)", created);
        }
        Command::UpdateSearchVectors => {
            orchestrator.update_search_vectors().await?;
            println!("Search vectors refreshed");
        }
        Command::HealthCheck => {
            let report = orchestrator.health_check().await;
            print_json(&report)?;
            if !report.healthy {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Stats => print_json(&orchestrator.stats().await?)?,
    }

    Ok(ExitCode::SUCCESS)
}
