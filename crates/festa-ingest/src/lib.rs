//! Ingestion pipeline: normalize, classify, dedupe, moderate, orchestrate.

use std::sync::Arc;

use anyhow::{Context, Result};
use festa_storage::{EventStore, InMemoryEventStore, PgEventStore};
use tracing::{info, warn};

pub mod approval;
pub mod classify;
pub mod config;
pub mod dedupe;
pub mod normalize;
mod pipeline;
mod scheduler;

pub use approval::{ApprovalError, ApprovalService, BulkStatusChange, StatusChange, StatusCounts};
pub use classify::{CategoryMeta, Classifier, RulesError};
pub use config::IngestConfig;
pub use dedupe::{Deduplicator, Outcome, Resolution, Resolved};
pub use normalize::{normalize, NormalizationError};
pub use pipeline::{AdapterSlot, IngestionPipeline};
pub use scheduler::build_scheduler;

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise an in-memory store.
pub async fn open_store(config: &IngestConfig) -> Result<Arc<dyn EventStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgEventStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("using postgres event store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, events are kept in memory for this process only");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
    }
}

/// Rules from `FESTA_RULES_DIR` when set, the built-in tables otherwise.
pub fn load_classifier(config: &IngestConfig) -> Result<Classifier> {
    match &config.rules_dir {
        Some(dir) => Classifier::from_dir(dir),
        None => Classifier::builtin().context("loading built-in rules"),
    }
}

/// Builds everything from the environment and runs one ingestion pass.
pub async fn run_ingestion_from_env() -> Result<festa_core::RunSummary> {
    let config = IngestConfig::from_env();
    let store = open_store(&config).await?;
    let classifier = load_classifier(&config)?;
    let pipeline = IngestionPipeline::new(&config, store, classifier)?;
    Ok(pipeline.run_ingestion().await)
}
