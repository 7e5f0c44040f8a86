//! Exhibition board: paginated HTML list, labelled detail pages fetched lazily.

use async_trait::async_trait;
use festa_core::RawCandidate;
use futures::stream::{self, StreamExt};
use scraper::Html;
use tracing::{debug, info, warn};

use crate::html::{element_text, first_matching, select_first_attr, select_first_text, selector};
use crate::{
    absolute_url, page_url, AdapterContext, AdapterError, AdapterOutput, SourceAdapter,
    SourceConfig, SourceShape,
};

const ITEM_SELECTORS: &[&str] = &["ul.event-list > li", "li.event-item", "table.board-list tbody tr"];
const LIST_CONTAINERS: &[&str] = &["ul.event-list", "table.board-list", ".no-data"];
const DETAIL_ROW_SELECTORS: &[&str] = &["div.view-info li", "dl.view-info > div", "table.view-table tr"];
const DETAIL_BODY_SELECTORS: &[&str] = &["div.view-content", "div.view-cont", "#content .txt"];

#[derive(Debug, Clone)]
pub struct ExpoBoardAdapter {
    config: SourceConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ListingItem {
    pub detail_url: String,
    pub title: String,
    pub period: Option<String>,
    pub place: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DetailFields {
    pub date_text: Option<String>,
    pub location_text: Option<String>,
    pub price_text: Option<String>,
    pub organizer: Option<String>,
    pub website_url: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
}

impl ExpoBoardAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn candidate(
        &self,
        ctx: &AdapterContext,
        item: ListingItem,
        detail: Option<DetailFields>,
    ) -> RawCandidate {
        let detail_fetched = detail.is_some();
        let detail = detail.unwrap_or_default();
        let mut candidate = RawCandidate::new(self.config.source_id.clone(), ctx.fetched_at);
        candidate.source_url = item.detail_url;
        candidate.title = item.title;
        candidate.raw_date_text = detail.date_text.or(item.period).unwrap_or_default();
        candidate.raw_location_text = detail.location_text.or(item.place).unwrap_or_default();
        candidate.raw_price_text = detail.price_text.unwrap_or_default();
        candidate.image_url = detail.image_url.or(item.image_url);
        candidate.description = detail.description.unwrap_or_default();
        candidate.organizer = detail.organizer.unwrap_or_default();
        candidate.website_url = detail.website_url;
        candidate.detail_fetched = detail_fetched;
        candidate
    }

    /// Resolves one listing page into candidates, fetching detail pages for unknown items only.
    pub(crate) async fn collect_page(
        &self,
        ctx: &AdapterContext,
        items: Vec<ListingItem>,
        out: &mut AdapterOutput,
    ) -> Result<(), AdapterError> {
        let source_id = self.config.source_id.as_str();
        let referer = self.config.referer.as_deref().unwrap_or(&self.config.base_url);

        let mut plan = Vec::with_capacity(items.len());
        for item in items {
            let known = ctx.is_known(source_id, &item.detail_url).await;
            plan.push((item, known));
        }

        let mut details = stream::iter(plan)
            .map(|(item, known)| async move {
                if known {
                    debug!(source_id, url = %item.detail_url, "known listing, skipping detail page");
                    return (item, Ok(None));
                }
                let body = ctx.get_text(source_id, &item.detail_url, Some(referer)).await;
                (item, body.map(Some))
            })
            .buffered(ctx.detail_concurrency.max(1));

        while let Some((item, result)) = details.next().await {
            match result? {
                None => out.candidates.push(self.candidate(ctx, item, None)),
                Some(body) => match parse_detail(source_id, &self.config.base_url, &body) {
                    Ok(detail) => out.candidates.push(self.candidate(ctx, item, Some(detail))),
                    Err(err) => {
                        warn!(source_id, url = %item.detail_url, error = %err, "skipping unparseable detail page");
                        out.item_failures += 1;
                    }
                },
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for ExpoBoardAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn shape(&self) -> SourceShape {
        SourceShape::HtmlListDetail
    }

    async fn fetch(&self, ctx: &AdapterContext) -> AdapterOutput {
        let source_id = self.config.source_id.as_str();
        let mut out = AdapterOutput::default();

        for page in 1..=self.config.max_pages.max(1) {
            if out.candidates.len() >= ctx.max_items {
                break;
            }
            let url = page_url(&self.config.listing_url, page);
            let body = match ctx
                .get_text(source_id, &url, self.config.referer.as_deref())
                .await
            {
                Ok(body) => body,
                Err(err) => return out.failed(err),
            };
            let (items, failures) = match parse_listing(source_id, &self.config.base_url, &body) {
                Ok(parsed) => parsed,
                Err(err) => return out.failed(err),
            };
            out.item_failures += failures;
            if items.is_empty() {
                break;
            }

            let remaining = ctx.max_items - out.candidates.len();
            let items = items.into_iter().take(remaining).collect();
            if let Err(err) = self.collect_page(ctx, items, &mut out).await {
                return out.failed(err);
            }
            info!(source_id, page, total = out.candidates.len(), "listing page collected");
        }
        out
    }
}

/// Returns the listing items plus the number of malformed rows skipped.
pub(crate) fn parse_listing(
    source_id: &str,
    base_url: &str,
    html: &str,
) -> Result<(Vec<ListingItem>, usize), AdapterError> {
    let document = Html::parse_document(html);
    let Some(item_sel) = first_matching(source_id, &document, ITEM_SELECTORS)? else {
        if first_matching(source_id, &document, LIST_CONTAINERS)?.is_some() {
            return Ok((Vec::new(), 0));
        }
        return Err(AdapterError::format_change(source_id, "listing container not found"));
    };

    let link_sel = selector(source_id, "a[href]")?;
    let title_sel = selector(source_id, ".event-title, .tit, td.subject")?;
    let period_sel = selector(source_id, ".event-period, .period, td.date")?;
    let place_sel = selector(source_id, ".event-place, .place, td.place")?;
    let img_sel = selector(source_id, "img[src]")?;

    let mut items = Vec::new();
    let mut failures = 0;
    for row in document.select(&item_sel) {
        let detail_url = select_first_attr(row, &link_sel, "href")
            .and_then(|href| absolute_url(base_url, &href));
        let title = select_first_text(row, &title_sel)
            .or_else(|| row.select(&link_sel).next().and_then(element_text));
        let (Some(detail_url), Some(title)) = (detail_url, title) else {
            failures += 1;
            continue;
        };
        items.push(ListingItem {
            detail_url,
            title,
            period: select_first_text(row, &period_sel),
            place: select_first_text(row, &place_sel),
            image_url: select_first_attr(row, &img_sel, "src"),
        });
    }
    Ok((items, failures))
}

fn split_label(text: &str) -> Option<(&str, &str)> {
    let idx = text.find([':', '：'])?;
    let (label, rest) = text.split_at(idx);
    let value = rest.trim_start_matches([':', '：']).trim();
    Some((label.trim(), value))
}

/// Labelled rows keep their label; the normalizer strips it.
pub(crate) fn parse_detail(source_id: &str, base_url: &str, html: &str) -> Result<DetailFields, AdapterError> {
    let document = Html::parse_document(html);
    let rows = first_matching(source_id, &document, DETAIL_ROW_SELECTORS)?;
    let body = first_matching(source_id, &document, DETAIL_BODY_SELECTORS)?;
    if rows.is_none() && body.is_none() {
        return Err(AdapterError::format_change(source_id, "detail info block not found"));
    }

    let link_sel = selector(source_id, "a[href]")?;
    let img_sel = selector(source_id, "div.view-poster img[src], .poster img[src]")?;
    let mut detail = DetailFields::default();

    if let Some(rows) = rows {
        for row in document.select(&rows) {
            let Some(text) = element_text(row) else {
                continue;
            };
            let Some((label, value)) = split_label(&text) else {
                continue;
            };
            if label.contains("기간") || label.contains("일시") || label.contains("일정") {
                detail.date_text.get_or_insert(text.clone());
            } else if label.contains("장소") || label.contains("위치") {
                detail.location_text.get_or_insert(text.clone());
            } else if label.contains("관람료") || label.contains("입장료") || label.contains("요금") {
                detail.price_text.get_or_insert(text.clone());
            } else if label.contains("주최") || label.contains("주관") {
                detail.organizer.get_or_insert(value.to_string());
            } else if label.contains("홈페이지") {
                let href = select_first_attr(row, &link_sel, "href").unwrap_or_else(|| value.to_string());
                detail.website_url = absolute_url(base_url, &href);
            }
        }
    }

    if let Some(body) = body {
        detail.description = document.select(&body).next().and_then(element_text);
    }
    detail.image_url = document
        .select(&img_sel)
        .next()
        .and_then(|n| n.value().attr("src"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Ok(detail)
}
