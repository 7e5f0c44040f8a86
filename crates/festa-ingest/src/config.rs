use std::path::PathBuf;
use std::time::Duration;

use festa_storage::{HttpClientConfig, DEFAULT_USER_AGENT};

const MIN_HTTP_TIMEOUT_SECS: u64 = 15;
const MAX_HTTP_TIMEOUT_SECS: u64 = 30;

/// Runtime settings, read from `FESTA_*` environment variables with defaults.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Unset means the in-memory store.
    pub database_url: Option<String>,
    pub sources_file: PathBuf,
    /// Overrides the built-in region/category rules when set.
    pub rules_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_items_per_adapter: usize,
    pub request_delay_ms: u64,
    pub detail_concurrency: usize,
    pub run_deadline_secs: u64,
    pub scheduler_cron: String,
    pub web_port: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| var(key).and_then(|v| v.parse().ok()).unwrap_or(default);

        Self {
            database_url: var("DATABASE_URL"),
            sources_file: var("FESTA_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            rules_dir: var("FESTA_RULES_DIR").map(PathBuf::from),
            user_agent: var("FESTA_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("FESTA_HTTP_TIMEOUT_SECS", 20)
                .clamp(MIN_HTTP_TIMEOUT_SECS, MAX_HTTP_TIMEOUT_SECS),
            max_items_per_adapter: number("FESTA_MAX_ITEMS_PER_ADAPTER", 200) as usize,
            request_delay_ms: number("FESTA_REQUEST_DELAY_MS", 750),
            detail_concurrency: number("FESTA_DETAIL_CONCURRENCY", 3).max(1) as usize,
            run_deadline_secs: number("FESTA_RUN_DEADLINE_SECS", 900),
            scheduler_cron: var("FESTA_SCHEDULER_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            web_port: var("FESTA_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }
}
