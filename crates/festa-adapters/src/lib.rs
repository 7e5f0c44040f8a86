//! Source adapter contracts, the source registry and the live adapters.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use festa_core::{url_dedupe_key, AdapterFailureKind, RawCandidate};
use festa_storage::{EventStore, FetchError, FetchRequest, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

mod contest_board;
mod expo_board;
mod festival_feed;
mod html;

pub use contest_board::{split_delimited_blob, ContestBoardAdapter, DelimitedPage};
pub use expo_board::ExpoBoardAdapter;
pub use festival_feed::{extract_json_payload, FestivalFeedAdapter};

/// How a source publishes its listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceShape {
    /// HTML list pages, labelled HTML detail pages.
    HtmlListDetail,
    /// `HTML_CHUNK:::PAGE:::TOTAL` text blobs.
    DelimitedBlob,
    /// JSON wrapped in a callback or script text.
    JsonInText,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        for source in &registry.sources {
            url::Url::parse(&source.base_url)
                .with_context(|| format!("base_url of {}", source.source_id))?;
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
    /// May contain `{page}` or `{cursor}` placeholders.
    pub listing_url: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_max_pages() -> usize {
    5
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id}: transport failure: {error}")]
    Transport {
        source_id: String,
        #[source]
        error: FetchError,
    },
    #[error("{source_id}: unexpected source format: {detail}")]
    FormatChange { source_id: String, detail: String },
    #[error("{source_id}: run deadline reached")]
    Cancelled { source_id: String },
}

impl AdapterError {
    pub fn format_change(source_id: &str, detail: impl Into<String>) -> Self {
        AdapterError::FormatChange {
            source_id: source_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> AdapterFailureKind {
        match self {
            AdapterError::Transport { .. } => AdapterFailureKind::Transport,
            AdapterError::FormatChange { .. } => AdapterFailureKind::FormatChange,
            AdapterError::Cancelled { .. } => AdapterFailureKind::Cancelled,
        }
    }
}

/// What one adapter produced in one run. `error` does not discard `candidates`.
#[derive(Debug, Default)]
pub struct AdapterOutput {
    pub candidates: Vec<RawCandidate>,
    pub item_failures: usize,
    pub error: Option<AdapterError>,
}

impl AdapterOutput {
    pub fn failed(mut self, error: AdapterError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Per-run, per-adapter execution context.
#[derive(Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub http: Arc<HttpFetcher>,
    pub store: Arc<dyn EventStore>,
    pub cancel: CancellationToken,
    pub max_items: usize,
    pub request_interval: Duration,
    pub detail_concurrency: usize,
}

impl AdapterContext {
    /// Shared fetch helper: cancellation check, politeness interval, timeout, referer.
    pub async fn get_text(
        &self,
        source_id: &str,
        url: &str,
        referer: Option<&str>,
    ) -> Result<String, AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled {
                source_id: source_id.to_string(),
            });
        }
        self.http
            .fetch_text(
                self.run_id,
                FetchRequest {
                    source_id,
                    url,
                    referer,
                    min_interval: self.request_interval,
                },
            )
            .await
            .map_err(|error| AdapterError::Transport {
                source_id: source_id.to_string(),
                error,
            })
    }

    /// Whether a listing with this detail URL was ingested before. Lookup errors count as unknown.
    pub async fn is_known(&self, source_id: &str, source_url: &str) -> bool {
        let Some(key) = url_dedupe_key(source_url) else {
            return false;
        };
        match self.store.find_by_dedupe_key(source_id, &key).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(source_id, source_url, error = %err, "known-listing lookup failed");
                false
            }
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn shape(&self) -> SourceShape;

    /// Never panics on bad markup; failures are reported inside the output.
    async fn fetch(&self, ctx: &AdapterContext) -> AdapterOutput;
}

pub fn adapter_for_source(config: &SourceConfig) -> Option<Arc<dyn SourceAdapter>> {
    match config.source_id.as_str() {
        "expo-board" => Some(Arc::new(ExpoBoardAdapter::new(config.clone()))),
        "contest-board" => Some(Arc::new(ContestBoardAdapter::new(config.clone()))),
        "festival-feed" => Some(Arc::new(FestivalFeedAdapter::new(config.clone()))),
        _ => None,
    }
}

pub(crate) fn page_url(template: &str, page: usize) -> String {
    template.replace("{page}", &page.to_string())
}

pub(crate) fn cursor_url(template: &str, cursor: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(cursor.as_bytes()).collect();
    template.replace("{cursor}", &encoded)
}

/// Absolute URL for a link found on a source page; `None` for empty or unusable links.
pub(crate) fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href == "#" {
        return None;
    }
    let base = url::Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REGISTRY: &str = r#"
sources:
  - source_id: expo-board
    display_name: Expo board
    enabled: true
    base_url: https://expo.example.kr
    listing_url: https://expo.example.kr/exhibition/list.do?page={page}
  - source_id: contest-board
    display_name: Contest board
    enabled: false
    base_url: https://contest.example.kr
    listing_url: https://contest.example.kr/ajax/list?page={page}
    referer: https://contest.example.kr/contest
    max_pages: 2
    request_delay_ms: 1500
"#;

    #[test]
    fn registry_loads_defaults_and_filters_enabled() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REGISTRY.as_bytes()).unwrap();
        let registry = SourceRegistry::load(file.path()).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].max_pages, 5);
        assert_eq!(registry.sources[1].request_delay_ms, Some(1500));
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["expo-board"]);
    }

    #[test]
    fn registry_rejects_bad_base_url() {
        let bad = REGISTRY.replace("https://expo.example.kr\n", "not a url\n");
        assert!(SourceRegistry::from_yaml(&bad).is_err());
    }

    #[test]
    fn every_known_source_id_has_an_adapter() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        for source in &registry.sources {
            let adapter = adapter_for_source(source).expect("adapter registered");
            assert_eq!(adapter.source_id(), source.source_id);
        }
        let mut unknown = registry.sources[0].clone();
        unknown.source_id = "somewhere-else".into();
        assert!(adapter_for_source(&unknown).is_none());
    }

    #[test]
    fn url_helpers_resolve_and_encode() {
        assert_eq!(
            absolute_url("https://expo.example.kr/exhibition/list.do", "view.do?seq=3").as_deref(),
            Some("https://expo.example.kr/exhibition/view.do?seq=3")
        );
        assert_eq!(
            absolute_url("https://a.kr/x", "//cdn.a.kr/p.jpg").as_deref(),
            Some("https://cdn.a.kr/p.jpg")
        );
        assert_eq!(absolute_url("https://a.kr", "javascript:void(0)"), None);
        assert_eq!(page_url("https://a.kr/list?page={page}", 3), "https://a.kr/list?page=3");
        assert_eq!(
            cursor_url("https://a.kr/feed?cursor={cursor}", "a b/c"),
            "https://a.kr/feed?cursor=a+b%2Fc"
        );
    }

    #[tokio::test]
    async fn cancelled_context_refuses_to_fetch() {
        let ctx = test_support::context();
        ctx.cancel.cancel();
        let err = ctx
            .get_text("expo-board", "https://expo.example.kr", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AdapterFailureKind::Cancelled);
    }
}
