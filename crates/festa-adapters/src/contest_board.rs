//! Contest board: an AJAX endpoint answering `HTML_CHUNK:::PAGE:::TOTAL`.

use async_trait::async_trait;
use festa_core::{Category, RawCandidate};
use scraper::Html;
use tracing::info;

use crate::html::{first_matching, select_first_attr, select_first_text, selector};
use crate::{
    absolute_url, page_url, AdapterContext, AdapterError, AdapterOutput, SourceAdapter,
    SourceConfig, SourceShape,
};

const DELIMITER: &str = ":::";
const ITEM_SELECTORS: &[&str] = &["li.contest-item", "div.contest-item", "tr.contest-row"];
const LIST_CONTAINERS: &[&str] = &["ul.contest-list", "table.contest-table", ".no-data"];

#[derive(Debug, Clone)]
pub struct ContestBoardAdapter {
    config: SourceConfig,
}

/// One decoded blob: the HTML fragment and its page position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedPage {
    pub html: String,
    pub page: usize,
    pub total: usize,
}

/// Splits from the right, so `:::` inside the HTML fragment is harmless.
pub fn split_delimited_blob(source_id: &str, body: &str) -> Result<DelimitedPage, AdapterError> {
    let mut parts = body.trim().rsplitn(3, DELIMITER);
    let (Some(total), Some(page), Some(html)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AdapterError::format_change(
            source_id,
            "response is not HTML_CHUNK:::PAGE:::TOTAL",
        ));
    };
    let parse = |label: &str, value: &str| {
        value.trim().parse::<usize>().map_err(|_| {
            AdapterError::format_change(source_id, format!("{label} is not a number: {value:?}"))
        })
    };
    Ok(DelimitedPage {
        html: html.to_string(),
        page: parse("page", page)?,
        total: parse("total", total)?,
    })
}

impl ContestBoardAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    pub(crate) fn parse_chunk(
        &self,
        ctx: &AdapterContext,
        html: &str,
    ) -> Result<(Vec<RawCandidate>, usize), AdapterError> {
        let source_id = self.config.source_id.as_str();
        let fragment = Html::parse_fragment(html);
        let Some(item_sel) = first_matching(source_id, &fragment, ITEM_SELECTORS)? else {
            if html.trim().is_empty() || first_matching(source_id, &fragment, LIST_CONTAINERS)?.is_some() {
                return Ok((Vec::new(), 0));
            }
            return Err(AdapterError::format_change(source_id, "no contest rows in chunk"));
        };

        let link_sel = selector(source_id, "a[href]")?;
        let title_sel = selector(source_id, ".tit, .contest-title")?;
        let period_sel = selector(source_id, ".period, .date")?;
        let host_sel = selector(source_id, ".host, .organizer")?;
        let benefit_sel = selector(source_id, ".benefit, .prize")?;
        let fee_sel = selector(source_id, ".fee")?;
        let img_sel = selector(source_id, "img[src]")?;

        let mut candidates = Vec::new();
        let mut failures = 0;
        for row in fragment.select(&item_sel) {
            let href = select_first_attr(row, &link_sel, "href")
                .or_else(|| row.value().attr("data-href").map(str::to_string));
            let source_url = href.and_then(|h| absolute_url(&self.config.base_url, &h));
            let title = select_first_text(row, &title_sel);
            let period = select_first_text(row, &period_sel);
            let (Some(source_url), Some(title), Some(period)) = (source_url, title, period) else {
                failures += 1;
                continue;
            };

            let mut candidate = RawCandidate::new(source_id, ctx.fetched_at);
            candidate.source_url = source_url;
            candidate.title = title;
            candidate.raw_date_text = period;
            candidate.raw_price_text = select_first_text(row, &fee_sel).unwrap_or_default();
            candidate.organizer = select_first_text(row, &host_sel).unwrap_or_default();
            candidate.description = select_first_text(row, &benefit_sel).unwrap_or_default();
            candidate.image_url = select_first_attr(row, &img_sel, "src");
            candidate.category_hint = Some(Category::Contest);
            candidates.push(candidate);
        }
        Ok((candidates, failures))
    }
}

#[async_trait]
impl SourceAdapter for ContestBoardAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn shape(&self) -> SourceShape {
        SourceShape::DelimitedBlob
    }

    async fn fetch(&self, ctx: &AdapterContext) -> AdapterOutput {
        let source_id = self.config.source_id.as_str();
        let referer = self.config.referer.as_deref().or(Some(self.config.base_url.as_str()));
        let mut out = AdapterOutput::default();

        for page in 1..=self.config.max_pages.max(1) {
            if out.candidates.len() >= ctx.max_items {
                break;
            }
            let url = page_url(&self.config.listing_url, page);
            let body = match ctx.get_text(source_id, &url, referer).await {
                Ok(body) => body,
                Err(err) => return out.failed(err),
            };
            let blob = match split_delimited_blob(source_id, &body) {
                Ok(blob) => blob,
                Err(err) => return out.failed(err),
            };
            if blob.total == 0 {
                info!(source_id, "contest board reports no open contests");
                break;
            }
            let (candidates, failures) = match self.parse_chunk(ctx, &blob.html) {
                Ok(parsed) => parsed,
                Err(err) => return out.failed(err),
            };
            out.item_failures += failures;
            let remaining = ctx.max_items - out.candidates.len();
            let last_page = candidates.is_empty() || blob.page >= blob.total;
            out.candidates.extend(candidates.into_iter().take(remaining));
            info!(source_id, page = blob.page, total = blob.total, "contest chunk collected");
            if last_page {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, source};
    use festa_core::AdapterFailureKind;

    const CHUNK: &str = r#"<ul>
<li class="contest-item">
  <a href="/contest/view/5521"><span class="tit">제7회 대한민국 청소년 영상 공모전</span></a>
  <span class="period">접수기간 : 2025.10.01 ~ 2025.11.30</span>
  <span class="host">문화체육관광부</span>
  <span class="benefit">대상 500만원</span>
  <img src="//cdn.contest.example.kr/poster/5521.png">
</li>
<li class="contest-item">
  <a href="/contest/view/5522"><span class="tit">기간 없는 공모전</span></a>
</li>
</ul>:::1:::4"#;

    fn adapter() -> ContestBoardAdapter {
        ContestBoardAdapter::new(source(
            "contest-board",
            "https://contest.example.kr",
            "https://contest.example.kr/ajax/list?page={page}",
        ))
    }

    #[test]
    fn blob_splits_into_chunk_and_position() {
        let blob = split_delimited_blob("contest-board", CHUNK).unwrap();
        assert_eq!(blob.page, 1);
        assert_eq!(blob.total, 4);
        assert!(blob.html.starts_with("<ul>"));
        assert!(blob.html.ends_with("</ul>"));
    }

    #[test]
    fn delimiters_inside_the_html_are_kept() {
        let blob = split_delimited_blob("contest-board", "<p>a:::b</p>:::2:::3").unwrap();
        assert_eq!(blob.html, "<p>a:::b</p>");
        assert_eq!((blob.page, blob.total), (2, 3));
    }

    #[test]
    fn body_without_delimiters_is_a_format_change() {
        let err = split_delimited_blob("contest-board", "<html>maintenance</html>").unwrap_err();
        assert_eq!(err.kind(), AdapterFailureKind::FormatChange);
        let err = split_delimited_blob("contest-board", "<ul></ul>:::one:::4").unwrap_err();
        assert_eq!(err.kind(), AdapterFailureKind::FormatChange);
    }

    #[test]
    fn chunk_rows_become_contest_candidates() {
        let ctx = context();
        let blob = split_delimited_blob("contest-board", CHUNK).unwrap();
        let (candidates, failures) = adapter().parse_chunk(&ctx, &blob.html).unwrap();
        assert_eq!(failures, 1);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.source_url, "https://contest.example.kr/contest/view/5521");
        assert_eq!(c.title, "제7회 대한민국 청소년 영상 공모전");
        assert_eq!(c.raw_date_text, "접수기간 : 2025.10.01 ~ 2025.11.30");
        assert_eq!(c.organizer, "문화체육관광부");
        assert_eq!(c.description, "대상 500만원");
        assert_eq!(c.image_url.as_deref(), Some("//cdn.contest.example.kr/poster/5521.png"));
        assert_eq!(c.category_hint, Some(Category::Contest));
        assert!(c.detail_fetched);
    }

    #[test]
    fn empty_chunk_ends_pagination_and_foreign_markup_does_not() {
        let ctx = context();
        let (candidates, _) = adapter().parse_chunk(&ctx, "  ").unwrap();
        assert!(candidates.is_empty());
        let err = adapter().parse_chunk(&ctx, "<div class='card'>x</div>").unwrap_err();
        assert_eq!(err.kind(), AdapterFailureKind::FormatChange);
    }

    #[test]
    fn empty_contest_list_is_not_a_format_change() {
        let ctx = context();
        let blob = split_delimited_blob("contest-board", r#"<ul class="contest-list"></ul>:::1:::0"#).unwrap();
        assert_eq!(blob.total, 0);
        let (candidates, failures) = adapter().parse_chunk(&ctx, &blob.html).unwrap();
        assert!(candidates.is_empty());
        assert_eq!(failures, 0);

        let (candidates, _) = adapter()
            .parse_chunk(&ctx, r#"<p class="no-data">진행 중인 공모전이 없습니다.</p>"#)
            .unwrap();
        assert!(candidates.is_empty());
    }
}
