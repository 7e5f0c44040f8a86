//! Field normalizer: source-shaped text into typed, cleaned draft fields.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use festa_core::{EventDraft, RawCandidate};
use regex::{Captures, Regex};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("title is empty")]
    MissingTitle,
    #[error("unrecognized date text {0:?}")]
    UnrecognizedDate(String),
    #[error("end date {end} is before start date {start}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },
}

pub const FREE_PRICE: &str = "무료";

const FREE_TOKENS: &[&str] = &["무료", "free", "무료입장", "무료관람", "없음"];

static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*[\[【(]?\s*(?:(?:전시|행사|축제|접수|공모|운영|모집|개최|관람|공연)\s*)?(?:기간|일시|일정|장소|위치|관람료|입장료|참가비|요금|주최\s*/\s*주관|주최|주관)\s*[\]】)]?\s*[:：]?\s*",
    )
    .unwrap()
});

static WEEKDAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\(\s*(?:[월화수목금토일](?:요일)?|mon|tue|wed|thu|fri|sat|sun)[a-z]*\.?\s*\)").unwrap()
});

static TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:오전|오후|am|pm)?\s*\d{1,2}:\d{2}(?::\d{2})?\s*(?:am|pm)?").unwrap()
});

static FULL_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4})\s*[-./년]\s*(\d{1,2})\s*[-./월]\s*(\d{1,2})\s*일?\.?\s*(?:~|-|–|〜|～)\s*(\d{4})\s*[-./년]\s*(\d{1,2})\s*[-./월]\s*(\d{1,2})",
    )
    .unwrap()
});

static SHORT_END_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4})\s*[-./년]\s*(\d{1,2})\s*[-./월]\s*(\d{1,2})\s*일?\.?\s*(?:~|-|–|〜|～)\s*(\d{1,2})\s*[-./월]\s*(\d{1,2})",
    )
    .unwrap()
});

static SINGLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})\s*[-./년]\s*(\d{1,2})\s*[-./월]\s*(\d{1,2})").unwrap());

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,]*").unwrap());

static FREE_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)무료|\bfree\b").unwrap());

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops a leading field label such as `전시기간 :` or `장소:`.
pub fn strip_label(text: &str) -> String {
    collapse(&LABEL.replace(text, ""))
}

fn ymd(caps: &Captures<'_>, y: usize, m: usize, d: usize) -> Option<NaiveDate> {
    let year = caps.get(y)?.as_str().parse().ok()?;
    let month = caps.get(m)?.as_str().parse().ok()?;
    let day = caps.get(d)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// The year rolls over only when the month wraps; a same-month earlier day stays inverted.
fn md_after(caps: &Captures<'_>, start: NaiveDate, m: usize, d: usize) -> Option<NaiveDate> {
    let month: u32 = caps.get(m)?.as_str().parse().ok()?;
    let day = caps.get(d)?.as_str().parse().ok()?;
    let year = if month < start.month() {
        start.year() + 1
    } else {
        start.year()
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parses event period text. Patterns are tried from the most to the least specific.
pub fn parse_date_range(raw: &str) -> Result<(NaiveDate, Option<NaiveDate>), NormalizationError> {
    let unrecognized = || NormalizationError::UnrecognizedDate(raw.to_string());
    let stripped = strip_label(raw);
    let text = WEEKDAY.replace_all(&stripped, "");
    let text = TIME.replace_all(&text, " ");

    let (start, end) = if let Some(caps) = FULL_RANGE.captures(&text) {
        let start = ymd(&caps, 1, 2, 3).ok_or_else(unrecognized)?;
        (start, Some(ymd(&caps, 4, 5, 6).ok_or_else(unrecognized)?))
    } else if let Some(caps) = SHORT_END_RANGE.captures(&text) {
        let start = ymd(&caps, 1, 2, 3).ok_or_else(unrecognized)?;
        (start, Some(md_after(&caps, start, 4, 5).ok_or_else(unrecognized)?))
    } else if let Some(caps) = SINGLE.captures(&text) {
        (ymd(&caps, 1, 2, 3).ok_or_else(unrecognized)?, None)
    } else {
        return Err(unrecognized());
    };

    match end {
        Some(end) if end < start => Err(NormalizationError::InvertedRange { start, end }),
        _ => Ok((start, end)),
    }
}

/// Returns `(is_free, display price)`. Empty text is not free, and any non-zero
/// amount keeps the text paid even next to a free token (`성인 10,000원 / 어린이 무료`).
pub fn parse_price(raw: &str) -> (bool, String) {
    let text = strip_label(raw);
    if text.is_empty() {
        return (false, String::new());
    }
    let bare: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    let exact_token = FREE_TOKENS.contains(&bare.as_str());

    let amounts: Vec<u64> = AMOUNT
        .find_iter(&text)
        .filter_map(|m| m.as_str().replace(',', "").parse().ok())
        .collect();
    let any_paid = amounts.iter().any(|a| *a > 0);
    let all_zero = !amounts.is_empty() && !any_paid;

    if exact_token || (!any_paid && (all_zero || FREE_WORD.is_match(&text))) {
        (true, FREE_PRICE.to_string())
    } else {
        (false, text)
    }
}

/// Absolute http(s) URL for an image reference; `data:` URIs and junk are dropped.
pub fn resolve_image_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.to_ascii_lowercase().starts_with("data:") {
        return None;
    }
    let resolved = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok()?,
        Err(_) => return None,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// `base_url` is the source's configured base; the listing URL is used when it is absent.
pub fn normalize(candidate: RawCandidate, base_url: Option<&str>) -> Result<EventDraft, NormalizationError> {
    let title = collapse(&candidate.title);
    if title.is_empty() {
        return Err(NormalizationError::MissingTitle);
    }
    let (start_date, end_date) = parse_date_range(&candidate.raw_date_text)?;
    let (is_free, price) = parse_price(&candidate.raw_price_text);

    let source_url = candidate.source_url.trim().to_string();
    let base = base_url
        .and_then(|b| Url::parse(b).ok())
        .or_else(|| Url::parse(&source_url).ok());
    let image_url = candidate
        .image_url
        .as_deref()
        .and_then(|raw| resolve_image_url(raw, base.as_ref()));
    let website_url = candidate
        .website_url
        .map(|w| w.trim().to_string())
        .and_then(non_empty)
        .or_else(|| non_empty(source_url.clone()));

    Ok(EventDraft {
        source_id: candidate.source_id,
        title,
        start_date,
        end_date,
        location: strip_label(&candidate.raw_location_text),
        is_free,
        price,
        image_url,
        organizer: strip_label(&candidate.organizer),
        description: collapse(&candidate.description),
        website_url,
        source_url,
        category_hint: candidate.category_hint,
        detail_fetched: candidate.detail_fetched,
        crawled_at: candidate.fetched_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn recognized_patterns_parse_with_start_not_after_end() {
        let cases = [
            ("2025-11-28 ~ 2026-02-04", d(2025, 11, 28), Some(d(2026, 2, 4))),
            ("2025.10.10 - 2025.10.12", d(2025, 10, 10), Some(d(2025, 10, 12))),
            ("2025/05/01 – 2025/05/05", d(2025, 5, 1), Some(d(2025, 5, 5))),
            ("2025. 3. 1. 〜 2025. 3. 9.", d(2025, 3, 1), Some(d(2025, 3, 9))),
            ("2025년 11월 1일 ~ 2025년 11월 30일", d(2025, 11, 1), Some(d(2025, 11, 30))),
            ("2025.12.20 ~ 01.05", d(2025, 12, 20), Some(d(2026, 1, 5))),
            ("2025.06.01 ~ 06.15", d(2025, 6, 1), Some(d(2025, 6, 15))),
            ("2025년 12월 24일 ~ 1월 2일", d(2025, 12, 24), Some(d(2026, 1, 2))),
            ("2023.12.20 ~ 02.29", d(2023, 12, 20), Some(d(2024, 2, 29))),
            ("2025.11.15", d(2025, 11, 15), None),
            ("2025-11-28(금) ~ 2026-02-04(수)", d(2025, 11, 28), Some(d(2026, 2, 4))),
            ("2025.11.15 (토) 19:00 ~ 21:30", d(2025, 11, 15), None),
            ("전시기간 : 2025-11-28 ~ 2026-02-04", d(2025, 11, 28), Some(d(2026, 2, 4))),
            ("접수기간 2025.10.01 ~ 2025.11.30", d(2025, 10, 1), Some(d(2025, 11, 30))),
        ];
        for (text, start, end) in cases {
            let (s, e) = parse_date_range(text).unwrap_or_else(|err| panic!("{text}: {err}"));
            assert_eq!((s, e), (start, end), "{text}");
            if let Some(e) = e {
                assert!(s <= e, "{text}");
            }
        }
    }

    #[test]
    fn unparseable_dates_are_rejected_not_defaulted() {
        for text in ["", "상시 운영", "추후 공지", "2025.13.45"] {
            assert!(
                matches!(parse_date_range(text), Err(NormalizationError::UnrecognizedDate(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn end_before_start_is_rejected() {
        let err = parse_date_range("2025-12-10 ~ 2025-12-01").unwrap_err();
        assert_eq!(
            err,
            NormalizationError::InvertedRange {
                start: d(2025, 12, 10),
                end: d(2025, 12, 1)
            }
        );
        let err = parse_date_range("2025.06.10 ~ 06.05").unwrap_err();
        assert_eq!(
            err,
            NormalizationError::InvertedRange {
                start: d(2025, 6, 10),
                end: d(2025, 6, 5)
            }
        );
    }

    #[test]
    fn price_free_detection() {
        assert_eq!(parse_price("관람료 : 무료"), (true, "무료".to_string()));
        assert_eq!(parse_price("FREE"), (true, "무료".to_string()));
        assert_eq!(parse_price("무료입장"), (true, "무료".to_string()));
        assert_eq!(parse_price("없음"), (true, "무료".to_string()));
        assert_eq!(parse_price("0원"), (true, "무료".to_string()));
        assert_eq!(parse_price("성인 0원 / 청소년 0원"), (true, "무료".to_string()));
        assert_eq!(parse_price("성인 15,000원"), (false, "성인 15,000원".to_string()));
        assert_eq!(parse_price("입장료: 성인 5,000원 / 어린이 0원"), (false, "성인 5,000원 / 어린이 0원".to_string()));
        assert_eq!(parse_price("   "), (false, String::new()));
        assert_eq!(parse_price("무료 (사전 예약 필수)"), (true, "무료".to_string()));
    }

    #[test]
    fn partial_free_prices_stay_paid() {
        assert_eq!(
            parse_price("성인 10,000원 / 어린이 무료"),
            (false, "성인 10,000원 / 어린이 무료".to_string())
        );
        assert_eq!(
            parse_price("Freestyle 참가비 10,000원"),
            (false, "Freestyle 참가비 10,000원".to_string())
        );
        assert_eq!(parse_price("Freestyle 워크숍"), (false, "Freestyle 워크숍".to_string()));
    }

    #[test]
    fn image_urls_are_resolved_or_dropped() {
        let base = Url::parse("https://expo.example.kr/exhibition/list.do").unwrap();
        assert_eq!(
            resolve_image_url("/img/a.jpg", Some(&base)).as_deref(),
            Some("https://expo.example.kr/img/a.jpg")
        );
        assert_eq!(
            resolve_image_url("../a.jpg", Some(&base)).as_deref(),
            Some("https://expo.example.kr/a.jpg")
        );
        assert_eq!(
            resolve_image_url("//cdn.example.kr/p.png", Some(&base)).as_deref(),
            Some("https://cdn.example.kr/p.png")
        );
        assert_eq!(
            resolve_image_url("https://img.example.kr/x.jpg", None).as_deref(),
            Some("https://img.example.kr/x.jpg")
        );
        assert_eq!(resolve_image_url("data:image/png;base64,AAAA", Some(&base)), None);
        assert_eq!(resolve_image_url("/img/a.jpg", None), None);
        assert_eq!(resolve_image_url("  ", Some(&base)), None);
    }

    #[test]
    fn labels_are_stripped_from_fields() {
        assert_eq!(strip_label("개최장소 : 제주한라컨벤션센터"), "제주한라컨벤션센터");
        assert_eq!(strip_label("장소:  코엑스  A홀"), "코엑스 A홀");
        assert_eq!(strip_label("[주최] 서울특별시"), "서울특별시");
        assert_eq!(strip_label("주최/주관 : 부산관광공사"), "부산관광공사");
        assert_eq!(strip_label("올림픽공원"), "올림픽공원");
    }

    fn candidate() -> RawCandidate {
        let mut c = RawCandidate::new("expo-board", Utc::now());
        c.source_url = "https://expo.example.kr/exhibition/view.do?seq=1201".into();
        c.title = "  2025 제주   국제 관광 박람회 ".into();
        c.raw_date_text = "전시기간 : 2025-11-28 ~ 2026-02-04".into();
        c.raw_location_text = "개최장소 : 제주한라컨벤션센터".into();
        c.raw_price_text = "관람료 : 무료".into();
        c.image_url = Some("/upload/poster/1201.jpg".into());
        c
    }

    #[test]
    fn candidate_normalizes_into_draft() {
        let draft = normalize(candidate(), Some("https://expo.example.kr")).unwrap();
        assert_eq!(draft.title, "2025 제주 국제 관광 박람회");
        assert_eq!(draft.start_date, d(2025, 11, 28));
        assert_eq!(draft.end_date, Some(d(2026, 2, 4)));
        assert_eq!(draft.location, "제주한라컨벤션센터");
        assert!(draft.is_free);
        assert_eq!(draft.price, "무료");
        assert_eq!(draft.image_url.as_deref(), Some("https://expo.example.kr/upload/poster/1201.jpg"));
        assert_eq!(
            draft.website_url.as_deref(),
            Some("https://expo.example.kr/exhibition/view.do?seq=1201")
        );
    }

    #[test]
    fn blank_title_is_missing() {
        let mut c = candidate();
        c.title = " \n ".into();
        assert_eq!(normalize(c, None).unwrap_err(), NormalizationError::MissingTitle);
    }

    #[test]
    fn image_falls_back_to_listing_url_as_base() {
        let draft = normalize(candidate(), None).unwrap();
        assert_eq!(draft.image_url.as_deref(), Some("https://expo.example.kr/upload/poster/1201.jpg"));
    }
}
