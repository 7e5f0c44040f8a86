use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use festa_core::{ApprovalStatus, EventRecord, NormalizedEvent};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{EventStore, StatusFilter, StoreError};

/// Process-local store for tests and dry runs without a database.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<Uuid, EventRecord>,
    keys: HashMap<(String, String), Uuid>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn all(&self) -> Vec<EventRecord> {
        let mut rows: Vec<_> = self.inner.read().await.rows.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn find_by_dedupe_key(
        &self,
        source_id: &str,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .get(&(source_id.to_string(), dedupe_key.to_string()))
            .and_then(|id| inner.rows.get(id))
            .cloned())
    }

    async fn insert(&self, dedupe_key: &str, event: &NormalizedEvent) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (event.source_id.clone(), dedupe_key.to_string());
        if inner.keys.contains_key(&key) {
            return Err(StoreError::Conflict {
                source_id: key.0,
                dedupe_key: key.1,
            });
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        inner.rows.insert(
            id,
            EventRecord {
                id,
                dedupe_key: dedupe_key.to_string(),
                content_hash: event.content_hash(),
                created_at: now,
                updated_at: now,
                event: event.clone(),
            },
        );
        inner.keys.insert(key, id);
        Ok(id)
    }

    async fn update(&self, id: Uuid, event: &NormalizedEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let approval_status = row.event.approval_status;
        row.event = NormalizedEvent {
            approval_status,
            ..event.clone()
        };
        row.content_hash = row.event.content_hash();
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn set_approval_status(
        &self,
        ids: &[Uuid],
        target: ApprovalStatus,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for id in ids {
            if let Some(row) = inner.rows.get_mut(id) {
                if row.event.approval_status != Some(target) {
                    row.event.approval_status = Some(target);
                    row.updated_at = Utc::now();
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn count_where(&self, filter: StatusFilter) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .values()
            .filter(|r| filter.matches(r.event.approval_status))
            .count() as u64)
    }

    async fn list_by_status(
        &self,
        filter: StatusFilter,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .rows
            .values()
            .filter(|r| filter.matches(r.event.approval_status))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn repair_missing_status(&self, default: ApprovalStatus) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut repaired = 0;
        for row in inner.rows.values_mut() {
            if row.event.approval_status.is_none() {
                row.event.approval_status = Some(default);
                row.updated_at = Utc::now();
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}
