//! One ingestion run: adapters in parallel, each adapter's output funnelled through
//! normalize, classify and dedupe as soon as that adapter finishes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use festa_adapters::{adapter_for_source, AdapterContext, AdapterOutput, SourceAdapter, SourceRegistry};
use festa_core::{AdapterFailureKind, AdapterReport, RunSummary};
use festa_storage::{EventStore, HttpFetcher};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::Classifier;
use crate::config::IngestConfig;
use crate::dedupe::{Deduplicator, Outcome};
use crate::normalize::normalize;

/// A configured adapter plus the per-source settings the pipeline applies to it.
#[derive(Clone)]
pub struct AdapterSlot {
    pub adapter: Arc<dyn SourceAdapter>,
    pub base_url: Option<String>,
    pub request_interval: Duration,
}

pub struct IngestionPipeline {
    slots: Vec<AdapterSlot>,
    http: Arc<HttpFetcher>,
    store: Arc<dyn EventStore>,
    classifier: Arc<Classifier>,
    dedupe: Deduplicator,
    max_items: usize,
    detail_concurrency: usize,
    deadline: Duration,
}

impl IngestionPipeline {
    /// Builds adapters for every enabled source in the registry file.
    pub fn new(config: &IngestConfig, store: Arc<dyn EventStore>, classifier: Classifier) -> anyhow::Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file)?;
        let mut slots = Vec::new();
        for source in registry.enabled() {
            let Some(adapter) = adapter_for_source(source) else {
                warn!(source_id = %source.source_id, "no adapter registered for source, skipping");
                continue;
            };
            slots.push(AdapterSlot {
                adapter,
                base_url: Some(source.base_url.clone()),
                request_interval: source
                    .request_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| config.request_interval()),
            });
        }
        Self::with_slots(config, store, classifier, slots)
    }

    pub fn with_slots(
        config: &IngestConfig,
        store: Arc<dyn EventStore>,
        classifier: Classifier,
        slots: Vec<AdapterSlot>,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http fetcher")?;
        Ok(Self {
            slots,
            http: Arc::new(http),
            dedupe: Deduplicator::new(store.clone()),
            store,
            classifier: Arc::new(classifier),
            max_items: config.max_items_per_adapter,
            detail_concurrency: config.detail_concurrency,
            deadline: config.run_deadline(),
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.adapter.source_id()).collect()
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    pub fn classifier(&self) -> Arc<Classifier> {
        self.classifier.clone()
    }

    /// Never fails: every adapter failure ends up in the summary.
    pub async fn run_ingestion(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let cancel = CancellationToken::new();
        info!(%run_id, adapters = self.slots.len(), "ingestion run started");

        let deadline_timer = {
            let cancel = cancel.clone();
            let deadline = self.deadline;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!(%run_id, deadline_secs = deadline.as_secs(), "run deadline reached, cancelling adapters");
                cancel.cancel();
            })
        };

        let mut tasks = JoinSet::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let adapter = slot.adapter.clone();
            let span = info_span!("adapter", source_id = %adapter.source_id(), %run_id);
            let ctx = AdapterContext {
                run_id,
                fetched_at: started_at,
                http: self.http.clone(),
                store: self.store.clone(),
                cancel: cancel.child_token(),
                max_items: self.max_items,
                request_interval: slot.request_interval,
                detail_concurrency: self.detail_concurrency,
            };
            // The inner task turns a panicking adapter into a JoinError for this slot only.
            let inner = tokio::spawn(async move { adapter.fetch(&ctx).await }.instrument(span));
            tasks.spawn(async move { (index, inner.await) });
        }

        let mut reports: Vec<Option<AdapterReport>> = vec![None; self.slots.len()];
        let mut deadline_exceeded = false;
        while let Some(joined) = tasks.join_next().await {
            // Once the last adapter is back, processing time no longer counts against the deadline.
            if tasks.is_empty() {
                deadline_timer.abort();
                deadline_exceeded = cancel.is_cancelled();
            }
            match joined {
                Ok((index, Ok(output))) => {
                    let report = self.process_output(run_id, &self.slots[index], output).await;
                    reports[index] = Some(report);
                }
                Ok((index, Err(join_err))) => {
                    let source_id = self.slots[index].adapter.source_id();
                    error!(%run_id, source_id, error = %join_err, "adapter task crashed");
                    let mut report = AdapterReport::new(source_id);
                    report.error_kind = Some(AdapterFailureKind::Crashed);
                    report.error = Some(join_err.to_string());
                    reports[index] = Some(report);
                }
                Err(join_err) => error!(%run_id, error = %join_err, "adapter supervisor task failed"),
            }
        }
        deadline_timer.abort();

        let adapters: Vec<AdapterReport> = reports
            .into_iter()
            .enumerate()
            .map(|(index, report)| {
                report.unwrap_or_else(|| {
                    let mut report = AdapterReport::new(self.slots[index].adapter.source_id());
                    report.error_kind = Some(AdapterFailureKind::Crashed);
                    report.error = Some("adapter task vanished".to_string());
                    report
                })
            })
            .collect();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            deadline_exceeded,
            total_inserted: adapters.iter().map(|a| a.inserted).sum(),
            total_updated: adapters.iter().map(|a| a.updated).sum(),
            total_skipped: adapters.iter().map(|a| a.skipped).sum(),
            adapters,
        };
        info!(
            %run_id,
            inserted = summary.total_inserted,
            updated = summary.total_updated,
            skipped = summary.total_skipped,
            failed_adapters = summary.failed_adapters().count(),
            duration_ms = summary.duration_ms,
            deadline_exceeded = summary.deadline_exceeded,
            summary = %serde_json::to_string(&summary).unwrap_or_default(),
            "ingestion run finished"
        );
        summary
    }

    async fn process_output(&self, run_id: Uuid, slot: &AdapterSlot, output: AdapterOutput) -> AdapterReport {
        let source_id = slot.adapter.source_id();
        let mut report = AdapterReport::new(source_id);
        report.candidates = output.candidates.len();
        report.item_failures = output.item_failures;
        if let Some(err) = &output.error {
            warn!(%run_id, source_id, kind = ?err.kind(), error = %err, "adapter finished with an error");
            report.error_kind = Some(err.kind());
            report.error = Some(err.to_string());
        }

        for candidate in output.candidates {
            let url = candidate.source_url.clone();
            let draft = match normalize(candidate, slot.base_url.as_deref()) {
                Ok(draft) => draft,
                Err(err) => {
                    debug!(%run_id, source_id, %url, error = %err, "dropping candidate");
                    report.normalization_failures += 1;
                    continue;
                }
            };
            let detail_fetched = draft.detail_fetched;
            let event = self.classifier.classify(draft);
            match self.dedupe.persist(event, detail_fetched).await {
                Ok(Outcome::Inserted(_)) => report.inserted += 1,
                Ok(Outcome::Updated(_)) => report.updated += 1,
                Ok(Outcome::Skipped(_)) => report.skipped += 1,
                Err(err) => {
                    warn!(%run_id, source_id, %url, error = %err, "failed to persist event");
                    report.persistence_failures += 1;
                }
            }
        }

        info!(
            %run_id,
            source_id,
            candidates = report.candidates,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "adapter output processed"
        );
        report
    }
}
