use async_trait::async_trait;
use festa_core::{ApprovalStatus, EventRecord, NormalizedEvent};
use thiserror::Error;
use uuid::Uuid;

/// Which approval states a listing or count covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Any,
    /// Legacy rows that never received a status.
    Missing,
    Is(ApprovalStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: Option<ApprovalStatus>) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Missing => status.is_none(),
            StatusFilter::Is(want) => status == Some(*want),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique `(source_id, dedupe_key)` already taken, usually by a concurrent run.
    #[error("record with key {dedupe_key} already exists for {source_id}")]
    Conflict {
        source_id: String,
        dedupe_key: String,
    },
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persistence seam used by the pipeline and the moderation API.
///
/// `update` refreshes content fields and `crawled_at` only; approval state changes go
/// through `set_approval_status` exclusively.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_by_dedupe_key(
        &self,
        source_id: &str,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, StoreError>;

    async fn insert(&self, dedupe_key: &str, event: &NormalizedEvent) -> Result<Uuid, StoreError>;

    async fn update(&self, id: Uuid, event: &NormalizedEvent) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<EventRecord>, StoreError>;

    /// Returns how many rows actually changed state.
    async fn set_approval_status(
        &self,
        ids: &[Uuid],
        target: ApprovalStatus,
    ) -> Result<u64, StoreError>;

    async fn count_where(&self, filter: StatusFilter) -> Result<u64, StoreError>;

    /// Newest first.
    async fn list_by_status(
        &self,
        filter: StatusFilter,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Assigns `default` to every row without a status; returns the number repaired.
    async fn repair_missing_status(&self, default: ApprovalStatus) -> Result<u64, StoreError>;
}
