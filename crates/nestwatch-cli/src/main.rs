use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nestwatch_core::SimilarityOptions;
use nestwatch_storage::PgStore;
use nestwatch_sync::{open_store, LinkResult, ManualLinkService, SyncConfig, SyncService};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "nestwatch-cli")]
#[command(about = "nestwatch listing ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled job once.
    Sync,
    /// Run jobs on the configured cron schedule until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Link two listings as the same property.
    Link {
        a: Uuid,
        b: Uuid,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Detach the second listing from the first one's component.
    Unlink { a: Uuid, b: Uuid },
    /// Show the head of a listing's version component.
    Head { id: Uuid },
    /// Suggest unlinked listings similar to `id`.
    Similar {
        id: Uuid,
        #[arg(long)]
        min_score: Option<u32>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Delete { id: Uuid },
    Restore { id: Uuid },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn finish(result: LinkResult) -> Result<()> {
    print_json(&result)?;
    if !result.success {
        bail!(result.error.unwrap_or_else(|| "operation failed".to_string()));
    }
    Ok(())
}

async fn link_service(config: &SyncConfig) -> Result<ManualLinkService> {
    Ok(ManualLinkService::new(open_store(config).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let reports = nestwatch_sync::run_sync_once_from_env().await?;
            print_json(&reports)?;
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let store = open_store(&config).await?;
            let service = Arc::new(SyncService::new(config, store).await?);
            let Some(mut scheduler) = service.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %service.config().sync_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to migrate");
            };
            let mut store = PgStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Link { a, b, by } => {
            let service = link_service(&config).await?;
            finish(service.create_manual_link(a, b, &by).await)?;
        }
        Commands::Unlink { a, b } => {
            let service = link_service(&config).await?;
            finish(service.remove_manual_link(a, b).await)?;
        }
        Commands::Head { id } => {
            let service = link_service(&config).await?;
            finish(service.find_chain_head(id).await)?;
        }
        Commands::Similar {
            id,
            min_score,
            limit,
        } => {
            let service = link_service(&config).await?;
            let defaults = SimilarityOptions::default();
            let options = SimilarityOptions {
                min_score: min_score.unwrap_or(defaults.min_score),
                max_results: limit,
            };
            print_json(&service.suggest_links(id, options).await?)?;
        }
        Commands::Delete { id } => {
            let service = link_service(&config).await?;
            finish(service.delete_listing(id).await)?;
        }
        Commands::Restore { id } => {
            let service = link_service(&config).await?;
            finish(service.restore_listing(id).await)?;
        }
    }

    Ok(())
}
