use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::pipeline::IngestionPipeline;

/// Cron-driven runs. A tick that fires while the previous run is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<IngestionPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous ingestion run still in progress, skipping this tick");
                return;
            };
            let summary = pipeline.run_ingestion().await;
            info!(
                run_id = %summary.run_id,
                inserted = summary.total_inserted,
                updated = summary.total_updated,
                "scheduled ingestion run complete"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;

    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
