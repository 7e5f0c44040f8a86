//! Festival feed: JSON wrapped in a JSONP callback, paginated by `next_cursor`.

use async_trait::async_trait;
use festa_core::RawCandidate;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    absolute_url, cursor_url, AdapterContext, AdapterError, AdapterOutput, SourceAdapter,
    SourceConfig, SourceShape,
};

#[derive(Debug, Clone)]
pub struct FestivalFeedAdapter {
    config: SourceConfig,
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    items: Option<Vec<Value>>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    title: String,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    period: Option<String>,
    #[serde(default)]
    place: Option<String>,
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    fee: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

/// The JSON object embedded in a JSONP or script body: first `{` through last `}`.
pub fn extract_json_payload<'a>(source_id: &str, body: &'a str) -> Result<&'a str, AdapterError> {
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => Ok(&body[start..=end]),
        _ => Err(AdapterError::format_change(source_id, "no JSON object in response")),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl FestivalFeedAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn candidate(&self, ctx: &AdapterContext, item: FeedItem) -> RawCandidate {
        let mut candidate = RawCandidate::new(self.config.source_id.clone(), ctx.fetched_at);
        candidate.title = item.title;
        candidate.raw_date_text = match (non_empty(item.start_date), non_empty(item.end_date)) {
            (Some(start), Some(end)) => format!("{start} ~ {end}"),
            (Some(start), None) => start,
            _ => non_empty(item.period).unwrap_or_default(),
        };
        candidate.raw_location_text = [non_empty(item.place), non_empty(item.addr)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        candidate.raw_price_text = non_empty(item.fee).unwrap_or_default();
        candidate.image_url = non_empty(item.image);
        candidate.description = non_empty(item.overview).unwrap_or_default();
        candidate.organizer = non_empty(item.host).unwrap_or_default();
        candidate.website_url = non_empty(item.homepage);
        candidate.source_url = non_empty(item.link)
            .and_then(|link| absolute_url(&self.config.base_url, &link))
            .unwrap_or_default();
        candidate
    }

    /// Returns candidates, the malformed item count and the next cursor, if any.
    pub(crate) fn parse_page(
        &self,
        ctx: &AdapterContext,
        body: &str,
    ) -> Result<(Vec<RawCandidate>, usize, Option<String>), AdapterError> {
        let source_id = self.config.source_id.as_str();
        let payload = extract_json_payload(source_id, body)?;
        let page: FeedPage = serde_json::from_str(payload)
            .map_err(|e| AdapterError::format_change(source_id, format!("feed JSON: {e}")))?;
        let Some(items) = page.items else {
            return Err(AdapterError::format_change(source_id, "feed has no `items` array"));
        };

        let mut candidates = Vec::with_capacity(items.len());
        let mut failures = 0;
        for value in items {
            match serde_json::from_value::<FeedItem>(value) {
                Ok(item) => candidates.push(self.candidate(ctx, item)),
                Err(err) => {
                    debug!(source_id, error = %err, "skipping malformed feed item");
                    failures += 1;
                }
            }
        }
        Ok((candidates, failures, non_empty(page.next_cursor)))
    }
}

#[async_trait]
impl SourceAdapter for FestivalFeedAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn shape(&self) -> SourceShape {
        SourceShape::JsonInText
    }

    async fn fetch(&self, ctx: &AdapterContext) -> AdapterOutput {
        let source_id = self.config.source_id.as_str();
        let mut out = AdapterOutput::default();
        let mut cursor = String::new();

        for page in 1..=self.config.max_pages.max(1) {
            if out.candidates.len() >= ctx.max_items {
                break;
            }
            let url = cursor_url(&self.config.listing_url, &cursor);
            let body = match ctx
                .get_text(source_id, &url, self.config.referer.as_deref())
                .await
            {
                Ok(body) => body,
                Err(err) => return out.failed(err),
            };
            let (candidates, failures, next) = match self.parse_page(ctx, &body) {
                Ok(parsed) => parsed,
                Err(err) => return out.failed(err),
            };
            out.item_failures += failures;
            let remaining = ctx.max_items - out.candidates.len();
            out.candidates.extend(candidates.into_iter().take(remaining));
            info!(source_id, page, total = out.candidates.len(), "feed page collected");

            match next {
                Some(next) if next != cursor => cursor = next,
                _ => break,
            }
        }
        out
    }
}
