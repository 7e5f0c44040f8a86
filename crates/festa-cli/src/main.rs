use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use festa_adapters::{adapter_for_source, SourceRegistry};
use festa_ingest::{
    build_scheduler, load_classifier, open_store, run_ingestion_from_env, ApprovalService, IngestConfig,
    IngestionPipeline,
};
use festa_storage::PgEventStore;
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "festa")]
#[command(about = "Event listing ingestion and moderation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print its summary as JSON.
    Run,
    /// Run ingestion on the configured cron schedule until interrupted.
    Schedule,
    /// Serve the moderation API.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Give legacy rows without an approval status the default status.
    NormalizeStatuses,
    /// List configured sources.
    Sources,
    /// Print event counts per approval status.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_logs = std::env::var("FESTA_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    logging::init_logging(json_logs);
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = run_ingestion_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => {
            let store = open_store(&config).await?;
            let pipeline = Arc::new(IngestionPipeline::new(&config, store, load_classifier(&config)?)?);
            let mut sched = build_scheduler(pipeline, &config.scheduler_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scheduler_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => festa_web::serve_from_env().await?,
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgEventStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::NormalizeStatuses => {
            let approval = ApprovalService::new(open_store(&config).await?);
            let repaired = approval.normalize_legacy_statuses().await?;
            println!("normalized {repaired} legacy approval statuses");
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.sources_file)?;
            for source in &registry.sources {
                let shape = adapter_for_source(source)
                    .map(|a| format!("{:?}", a.shape()))
                    .unwrap_or_else(|| "no adapter".to_string());
                println!(
                    "{:<16} {:<8} {:<16} {}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    shape,
                    source.listing_url
                );
                if let Some(notes) = &source.notes {
                    println!("{:<16} {notes}", "");
                }
            }
        }
        Commands::Stats => {
            let approval = ApprovalService::new(open_store(&config).await?);
            let counts = approval.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    Ok(())
}
