//! Event persistence + polite HTTP fetch utilities for Festa.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::REFERER;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventStore;
pub use postgres::{PgEventStore, MIGRATOR};
pub use store::{EventStore, StatusFilter, StoreError};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 16,
            per_source_concurrency: 4,
        }
    }
}

/// Enforces a minimum spacing between consecutive requests to one source.
#[derive(Debug, Default)]
pub struct PolitenessGate {
    next_allowed: Mutex<Option<Instant>>,
}

impl PolitenessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for this source's turn. The lock is held while sleeping so callers queue up.
    pub async fn wait_turn(&self, min_interval: Duration) {
        let mut next = self.next_allowed.lock().await;
        if let Some(at) = *next {
            tokio::time::sleep_until(at).await;
        }
        *next = Some(Instant::now() + min_interval);
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    gates: Mutex<HashMap<String, Arc<PolitenessGate>>>,
}

/// One outbound GET on behalf of a source adapter.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub source_id: &'a str,
    pub url: &'a str,
    pub referer: Option<&'a str>,
    pub min_interval: Duration,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {timeout_secs}s fetching {url}")]
    Timeout { url: String, timeout_secs: u64 },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            timeout: config.timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn gate(&self, source_id: &str) -> Arc<PolitenessGate> {
        let mut map = self.gates.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(PolitenessGate::new()))
            .clone()
    }

    /// Single GET with timeout. No retries: a failed source is retried on the next run.
    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        request: FetchRequest<'_>,
    ) -> Result<String, FetchError> {
        let span = info_span!(
            "http_fetch",
            %run_id,
            source_id = request.source_id,
            url = request.url
        );
        self.fetch_text_inner(request).instrument(span).await
    }

    async fn fetch_text_inner(&self, request: FetchRequest<'_>) -> Result<String, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(request.source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        self.gate(request.source_id)
            .await
            .wait_turn(request.min_interval)
            .await;

        let mut builder = self.client.get(request.url);
        if let Some(referer) = request.referer {
            builder = builder.header(REFERER, referer);
        }

        let resp = builder
            .send()
            .await
            .map_err(|err| self.map_request_error(request.url, err))?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|err| self.map_request_error(request.url, err))?;
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody { url: final_url });
        }

        debug!(status = status.as_u16(), %final_url, bytes = body.len(), "fetched");
        Ok(body)
    }

    fn map_request_error(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn politeness_gate_spaces_consecutive_requests() {
        let gate = PolitenessGate::new();
        let interval = Duration::from_millis(60);
        let started = Instant::now();
        gate.wait_turn(interval).await;
        gate.wait_turn(interval).await;
        gate.wait_turn(interval).await;
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn first_request_is_not_delayed() {
        let gate = PolitenessGate::new();
        let started = Instant::now();
        gate.wait_turn(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn gates_are_scoped_per_source() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let a = fetcher.gate("expo-board").await;
        let b = fetcher.gate("contest-board").await;
        let a_again = fetcher.gate("expo-board").await;
        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let err = fetcher
            .fetch_text(
                Uuid::new_v4(),
                FetchRequest {
                    source_id: "test",
                    url: "http://127.0.0.1:9/unreachable",
                    referer: None,
                    min_interval: Duration::ZERO,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Request { .. } | FetchError::Timeout { .. }
        ));
    }
}
