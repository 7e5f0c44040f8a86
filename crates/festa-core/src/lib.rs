//! Core domain model for the Festa ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} code `{value}`")]
pub struct ParseCodeError {
    pub kind: &'static str,
    pub value: String,
}

/// Fixed category codes. Never free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Festival,
    Exhibition,
    Art,
    Contest,
    Concert,
    Sports,
    Market,
    Education,
    Food,
    Other,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Festival,
        Category::Exhibition,
        Category::Art,
        Category::Contest,
        Category::Concert,
        Category::Sports,
        Category::Market,
        Category::Education,
        Category::Food,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Festival => "festival",
            Category::Exhibition => "exhibition",
            Category::Art => "art",
            Category::Contest => "contest",
            Category::Concert => "concert",
            Category::Sports => "sports",
            Category::Market => "market",
            Category::Education => "education",
            Category::Food => "food",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseCodeError {
                kind: "category",
                value: s.to_string(),
            })
    }
}

/// The 17 first-level administrative regions plus `online` and `nationwide`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Seoul,
    Busan,
    Daegu,
    Incheon,
    Gwangju,
    Daejeon,
    Ulsan,
    Sejong,
    Gyeonggi,
    Gangwon,
    Chungbuk,
    Chungnam,
    Jeonbuk,
    Jeonnam,
    Gyeongbuk,
    Gyeongnam,
    Jeju,
    Online,
    Nationwide,
}

impl Region {
    pub const ALL: [Region; 19] = [
        Region::Seoul,
        Region::Busan,
        Region::Daegu,
        Region::Incheon,
        Region::Gwangju,
        Region::Daejeon,
        Region::Ulsan,
        Region::Sejong,
        Region::Gyeonggi,
        Region::Gangwon,
        Region::Chungbuk,
        Region::Chungnam,
        Region::Jeonbuk,
        Region::Jeonnam,
        Region::Gyeongbuk,
        Region::Gyeongnam,
        Region::Jeju,
        Region::Online,
        Region::Nationwide,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Seoul => "seoul",
            Region::Busan => "busan",
            Region::Daegu => "daegu",
            Region::Incheon => "incheon",
            Region::Gwangju => "gwangju",
            Region::Daejeon => "daejeon",
            Region::Ulsan => "ulsan",
            Region::Sejong => "sejong",
            Region::Gyeonggi => "gyeonggi",
            Region::Gangwon => "gangwon",
            Region::Chungbuk => "chungbuk",
            Region::Chungnam => "chungnam",
            Region::Jeonbuk => "jeonbuk",
            Region::Jeonnam => "jeonnam",
            Region::Gyeongbuk => "gyeongbuk",
            Region::Gyeongnam => "gyeongnam",
            Region::Jeju => "jeju",
            Region::Online => "online",
            Region::Nationwide => "nationwide",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseCodeError {
                kind: "region",
                value: s.to_string(),
            })
    }
}

/// Moderation state of an ingested record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub const ALL: [ApprovalStatus; 3] = [
        ApprovalStatus::Pending,
        ApprovalStatus::Approved,
        ApprovalStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    /// Nothing moves back to `pending`; a same-state request is always allowed.
    pub fn can_transition_to(self, target: ApprovalStatus) -> bool {
        use ApprovalStatus::*;
        matches!(
            (self, target),
            (Pending, Pending)
                | (Approved, Approved)
                | (Rejected, Rejected)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Rejected)
                | (Rejected, Approved)
        )
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApprovalStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseCodeError {
                kind: "approval status",
                value: s.to_string(),
            })
    }
}

/// Source-shaped listing handed from an adapter into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub raw_date_text: String,
    pub raw_location_text: String,
    pub raw_price_text: String,
    pub image_url: Option<String>,
    pub description: String,
    pub organizer: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub category_hint: Option<Category>,
    /// False when the adapter skipped the detail page of an already-known listing.
    #[serde(default = "default_true")]
    pub detail_fetched: bool,
}

fn default_true() -> bool {
    true
}

impl RawCandidate {
    pub fn new(source_id: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            source_url: String::new(),
            title: String::new(),
            raw_date_text: String::new(),
            raw_location_text: String::new(),
            raw_price_text: String::new(),
            image_url: None,
            description: String::new(),
            organizer: String::new(),
            fetched_at,
            website_url: None,
            category_hint: None,
            detail_fetched: true,
        }
    }
}

/// Normalized but not yet classified event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub source_id: String,
    pub title: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub location: String,
    pub is_free: bool,
    pub price: String,
    pub image_url: Option<String>,
    pub organizer: String,
    pub description: String,
    pub website_url: Option<String>,
    pub source_url: String,
    pub category_hint: Option<Category>,
    pub detail_fetched: bool,
    pub crawled_at: DateTime<Utc>,
}

/// Canonical event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub source_id: String,
    pub title: String,
    pub category: Category,
    pub region: Region,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub location: String,
    pub is_free: bool,
    pub price: String,
    pub image_url: Option<String>,
    pub organizer: String,
    pub description: String,
    pub website_url: Option<String>,
    pub source_url: String,
    /// `None` only for legacy rows written before moderation existed.
    pub approval_status: Option<ApprovalStatus>,
    pub crawled_at: DateTime<Utc>,
}

impl NormalizedEvent {
    /// SHA-256 over the content fields. Moderation state and crawl time are excluded.
    pub fn content_hash(&self) -> String {
        let end = self.end_date.map(|d| d.to_string()).unwrap_or_default();
        let start = self.start_date.to_string();
        let parts: [&str; 14] = [
            &self.source_id,
            &self.title,
            self.category.as_str(),
            self.region.as_str(),
            &start,
            &end,
            &self.location,
            if self.is_free { "free" } else { "paid" },
            &self.price,
            self.image_url.as_deref().unwrap_or_default(),
            &self.organizer,
            &self.description,
            self.website_url.as_deref().unwrap_or_default(),
            &self.source_url,
        ];
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.title.trim().is_empty() {
            return Err(InvariantViolation::EmptyTitle);
        }
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(InvariantViolation::EndBeforeStart {
                    start: self.start_date,
                    end,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("end date {end} is before start date {start}")]
    EndBeforeStart { start: NaiveDate, end: NaiveDate },
}

/// Collapses runs of whitespace and case-folds, so cosmetic differences do not split keys.
pub fn fold_key_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Dedupe key for sources with a stable per-item URL. `None` when the URL is blank.
pub fn url_dedupe_key(source_url: &str) -> Option<String> {
    let trimmed = source_url.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("url:{trimmed}"))
    }
}

/// Fallback dedupe key for sources without per-item URLs.
pub fn composite_dedupe_key(title: &str, start_date: NaiveDate, location: &str) -> String {
    format!(
        "composite:{}|{}|{}",
        fold_key_fragment(title),
        start_date,
        fold_key_fragment(location)
    )
}

impl NormalizedEvent {
    pub fn dedupe_key(&self) -> String {
        url_dedupe_key(&self.source_url).unwrap_or_else(|| {
            composite_dedupe_key(&self.title, self.start_date, &self.location)
        })
    }
}

/// A persisted canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub dedupe_key: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: NormalizedEvent,
}

/// Operator edit of content fields. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub category: Option<Category>,
    pub region: Option<Region>,
    pub start_date: Option<NaiveDate>,
    #[serde(deserialize_with = "explicit_null")]
    pub end_date: Option<Option<NaiveDate>>,
    pub location: Option<String>,
    pub is_free: Option<bool>,
    pub price: Option<String>,
    #[serde(deserialize_with = "explicit_null")]
    pub image_url: Option<Option<String>>,
    pub organizer: Option<String>,
    pub description: Option<String>,
    #[serde(deserialize_with = "explicit_null")]
    pub website_url: Option<Option<String>>,
}

// `"field": null` clears the value, an absent field leaves it alone.
fn explicit_null<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl EventPatch {
    pub fn apply_to(&self, event: &mut NormalizedEvent) {
        if let Some(v) = &self.title {
            event.title = v.trim().to_string();
        }
        if let Some(v) = self.category {
            event.category = v;
        }
        if let Some(v) = self.region {
            event.region = v;
        }
        if let Some(v) = self.start_date {
            event.start_date = v;
        }
        if let Some(v) = self.end_date {
            event.end_date = v;
        }
        if let Some(v) = &self.location {
            event.location = v.clone();
        }
        if let Some(v) = self.is_free {
            event.is_free = v;
        }
        if let Some(v) = &self.price {
            event.price = v.clone();
        }
        if let Some(v) = &self.image_url {
            event.image_url = v.clone();
        }
        if let Some(v) = &self.organizer {
            event.organizer = v.clone();
        }
        if let Some(v) = &self.description {
            event.description = v.clone();
        }
        if let Some(v) = &self.website_url {
            event.website_url = v.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFailureKind {
    /// Source unreachable, timed out, non-2xx or empty.
    Transport,
    /// Source answered but its markup no longer matches the adapter.
    FormatChange,
    /// Run deadline reached before the adapter finished.
    Cancelled,
    /// The adapter task itself died.
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterReport {
    pub source_id: String,
    pub candidates: usize,
    pub item_failures: usize,
    pub normalization_failures: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub persistence_failures: usize,
    pub error_kind: Option<AdapterFailureKind>,
    pub error: Option<String>,
}

impl AdapterReport {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            candidates: 0,
            item_failures: 0,
            normalization_failures: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            persistence_failures: 0,
            error_kind: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Outcome of one orchestration pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub deadline_exceeded: bool,
    pub adapters: Vec<AdapterReport>,
    pub total_inserted: usize,
    pub total_updated: usize,
    pub total_skipped: usize,
}

impl RunSummary {
    pub fn failed_adapters(&self) -> impl Iterator<Item = &AdapterReport> {
        self.adapters.iter().filter(|a| !a.succeeded())
    }

    pub fn adapter(&self, source_id: &str) -> Option<&AdapterReport> {
        self.adapters.iter().find(|a| a.source_id == source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> NormalizedEvent {
        NormalizedEvent {
            source_id: "expo-board".into(),
            title: "제주 국제 관광 박람회".into(),
            category: Category::Exhibition,
            region: Region::Jeju,
            start_date: NaiveDate::from_ymd_opt(2025, 11, 28).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 2, 4),
            location: "제주한라컨벤션센터".into(),
            is_free: true,
            price: "무료".into(),
            image_url: None,
            organizer: "제주관광공사".into(),
            description: "관광 박람회".into(),
            website_url: None,
            source_url: "https://expo.example.kr/view/1".into(),
            approval_status: Some(ApprovalStatus::Pending),
            crawled_at: Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn codes_round_trip_through_display_and_serde() {
        for region in Region::ALL {
            assert_eq!(region.to_string().parse::<Region>().unwrap(), region);
        }
        for category in Category::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
        assert!("atlantis".parse::<Region>().is_err());
    }

    #[test]
    fn transitions_never_return_to_pending() {
        use ApprovalStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Rejected));
        assert!(Rejected.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Pending));
        assert!(!Rejected.can_transition_to(Pending));
    }

    #[test]
    fn content_hash_ignores_moderation_and_crawl_time() {
        let a = sample_event();
        let mut b = a.clone();
        b.approval_status = Some(ApprovalStatus::Approved);
        b.crawled_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        b.description.push_str(" (연장)");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn patch_updates_only_present_fields_and_invariants_are_checked() {
        let mut event = sample_event();
        let patch = EventPatch {
            title: Some("  새 제목 ".into()),
            end_date: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut event);
        assert_eq!(event.title, "새 제목");
        assert_eq!(event.end_date, None);
        assert_eq!(event.location, "제주한라컨벤션센터");
        assert!(event.check_invariants().is_ok());

        event.end_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        assert!(matches!(
            event.check_invariants(),
            Err(InvariantViolation::EndBeforeStart { .. })
        ));
    }

    #[test]
    fn dedupe_key_prefers_url_then_folded_composite() {
        let mut event = sample_event();
        assert_eq!(event.dedupe_key(), "url:https://expo.example.kr/view/1");

        event.source_url = "   ".into();
        let a = event.dedupe_key();
        event.title = "제주  국제 관광   박람회".into();
        event.location = " 제주한라컨벤션센터 ".into();
        assert_eq!(event.dedupe_key(), a);
        assert!(a.starts_with("composite:"));
    }

    #[test]
    fn patch_json_distinguishes_null_from_absent() {
        let clear: EventPatch = serde_json::from_str(r#"{"end_date": null}"#).unwrap();
        assert_eq!(clear.end_date, Some(None));
        let untouched: EventPatch = serde_json::from_str(r#"{"title": "x"}"#).unwrap();
        assert_eq!(untouched.end_date, None);
    }
}
