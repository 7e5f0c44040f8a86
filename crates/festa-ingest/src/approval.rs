//! Human moderation: the approval state machine and operator edits.

use std::sync::Arc;

use festa_core::{ApprovalStatus, EventPatch, EventRecord, InvariantViolation};
use festa_storage::{EventStore, StatusFilter, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Status given to rows that predate moderation.
pub const LEGACY_DEFAULT_STATUS: ApprovalStatus = ApprovalStatus::Approved;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("event {0} not found")]
    NotFound(Uuid),
    #[error("event {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ApprovalStatus,
        to: ApprovalStatus,
    },
    #[error("invalid edit: {0}")]
    InvalidEdit(#[from] InvariantViolation),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub id: Uuid,
    pub status: ApprovalStatus,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkStatusChange {
    pub status: ApprovalStatus,
    pub requested: usize,
    pub changed: u64,
    pub missing: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
    /// Legacy rows without a status.
    pub missing: u64,
    pub total: u64,
}

#[derive(Clone)]
pub struct ApprovalService {
    store: Arc<dyn EventStore>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: Uuid) -> Result<EventRecord, ApprovalError> {
        self.store.get(id).await?.ok_or(ApprovalError::NotFound(id))
    }

    fn check_transition(record: &EventRecord, target: ApprovalStatus) -> Result<(), ApprovalError> {
        // A missing status behaves like pending.
        let from = record.event.approval_status.unwrap_or(ApprovalStatus::Pending);
        if from.can_transition_to(target) {
            Ok(())
        } else {
            Err(ApprovalError::InvalidTransition {
                id: record.id,
                from,
                to: target,
            })
        }
    }

    /// Idempotent: repeating a transition reports `changed: false`.
    pub async fn set_status(&self, id: Uuid, target: ApprovalStatus) -> Result<StatusChange, ApprovalError> {
        let record = self.get(id).await?;
        Self::check_transition(&record, target)?;
        let changed = self.store.set_approval_status(&[id], target).await? > 0;
        if changed {
            info!(%id, status = %target, "approval status changed");
        }
        Ok(StatusChange {
            id,
            status: target,
            changed,
        })
    }

    /// All-or-nothing on transition validity; unknown ids are reported, not fatal.
    pub async fn set_status_bulk(
        &self,
        ids: &[Uuid],
        target: ApprovalStatus,
    ) -> Result<BulkStatusChange, ApprovalError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for &id in ids {
            match self.store.get(id).await? {
                Some(record) => {
                    Self::check_transition(&record, target)?;
                    if !found.contains(&id) {
                        found.push(id);
                    }
                }
                None => missing.push(id),
            }
        }
        let changed = self.store.set_approval_status(&found, target).await?;
        info!(status = %target, requested = ids.len(), changed, "bulk approval status change");
        Ok(BulkStatusChange {
            status: target,
            requested: ids.len(),
            changed,
            missing,
        })
    }

    /// Gives legacy rows without a status the default; a second call repairs nothing.
    pub async fn normalize_legacy_statuses(&self) -> Result<u64, ApprovalError> {
        let repaired = self.store.repair_missing_status(LEGACY_DEFAULT_STATUS).await?;
        info!(repaired, status = %LEGACY_DEFAULT_STATUS, "legacy approval statuses normalized");
        Ok(repaired)
    }

    pub async fn list_by_status(
        &self,
        filter: StatusFilter,
        limit: usize,
    ) -> Result<Vec<EventRecord>, ApprovalError> {
        Ok(self.store.list_by_status(filter, limit).await?)
    }

    pub async fn counts(&self) -> Result<StatusCounts, ApprovalError> {
        let store = &self.store;
        Ok(StatusCounts {
            pending: store.count_where(StatusFilter::Is(ApprovalStatus::Pending)).await?,
            approved: store.count_where(StatusFilter::Is(ApprovalStatus::Approved)).await?,
            rejected: store.count_where(StatusFilter::Is(ApprovalStatus::Rejected)).await?,
            missing: store.count_where(StatusFilter::Missing).await?,
            total: store.count_where(StatusFilter::Any).await?,
        })
    }

    /// Applies an operator patch. The approval status is never touched here.
    pub async fn edit_fields(&self, id: Uuid, patch: &EventPatch) -> Result<EventRecord, ApprovalError> {
        let record = self.get(id).await?;
        let mut event = record.event;
        patch.apply_to(&mut event);
        event.check_invariants()?;
        self.store.update(id, &event).await.map_err(|err| match err {
            StoreError::NotFound(id) => ApprovalError::NotFound(id),
            other => other.into(),
        })?;
        info!(%id, "event fields edited");
        self.get(id).await
    }
}
