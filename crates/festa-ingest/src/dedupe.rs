//! Deciding Insert / Update / Skip against the store, and applying the decision.

use std::sync::Arc;

use festa_core::{ApprovalStatus, EventRecord, NormalizedEvent};
use festa_storage::{EventStore, StoreError};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Insert,
    Update(Uuid),
    Skip(Uuid),
}

/// A resolved candidate: the event to write (after inheritance) and its key.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub dedupe_key: String,
    pub event: NormalizedEvent,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted(Uuid),
    Updated(Uuid),
    Skipped(Uuid),
}

/// Empty optional fields of a listing-only candidate take the stored values.
fn inherit_detail_fields(event: &mut NormalizedEvent, stored: &NormalizedEvent) {
    if event.image_url.is_none() {
        event.image_url = stored.image_url.clone();
    }
    if event.organizer.is_empty() {
        event.organizer = stored.organizer.clone();
    }
    if event.description.is_empty() {
        event.description = stored.description.clone();
    }
    if event.price.is_empty() {
        event.price = stored.price.clone();
        event.is_free = stored.is_free;
    }
    // Without the detail page the website is only the listing URL fallback.
    event.website_url = stored.website_url.clone().or(event.website_url.take());
    // Category depends on the description the listing does not carry.
    event.category = stored.category;
}

#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn EventStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        mut event: NormalizedEvent,
        detail_fetched: bool,
    ) -> Result<Resolved, StoreError> {
        let dedupe_key = event.dedupe_key();
        let existing = self
            .store
            .find_by_dedupe_key(&event.source_id, &dedupe_key)
            .await?;

        let resolution = match existing {
            None => {
                event.approval_status = Some(ApprovalStatus::Pending);
                Resolution::Insert
            }
            Some(existing) => Self::compare(&mut event, &existing, detail_fetched),
        };
        Ok(Resolved {
            dedupe_key,
            event,
            resolution,
        })
    }

    fn compare(event: &mut NormalizedEvent, existing: &EventRecord, detail_fetched: bool) -> Resolution {
        if !detail_fetched {
            inherit_detail_fields(event, &existing.event);
        }
        event.approval_status = existing.event.approval_status;
        if event.content_hash() == existing.content_hash {
            Resolution::Skip(existing.id)
        } else {
            Resolution::Update(existing.id)
        }
    }

    /// Writes the decision. A conflicting concurrent insert is re-resolved once as an update.
    pub async fn apply(&self, resolved: Resolved) -> Result<Outcome, StoreError> {
        let Resolved {
            dedupe_key,
            mut event,
            resolution,
        } = resolved;

        match resolution {
            Resolution::Skip(id) => Ok(Outcome::Skipped(id)),
            Resolution::Update(id) => {
                self.store.update(id, &event).await?;
                Ok(Outcome::Updated(id))
            }
            Resolution::Insert => match self.store.insert(&dedupe_key, &event).await {
                Ok(id) => Ok(Outcome::Inserted(id)),
                Err(StoreError::Conflict { source_id, dedupe_key }) => {
                    debug!(%source_id, %dedupe_key, "insert lost a race, updating instead");
                    let existing = self
                        .store
                        .find_by_dedupe_key(&source_id, &dedupe_key)
                        .await?
                        .ok_or_else(|| {
                            StoreError::Corrupt(format!("conflicting row {source_id}/{dedupe_key} vanished"))
                        })?;
                    match Self::compare(&mut event, &existing, true) {
                        Resolution::Skip(id) => Ok(Outcome::Skipped(id)),
                        _ => {
                            self.store.update(existing.id, &event).await?;
                            Ok(Outcome::Updated(existing.id))
                        }
                    }
                }
                Err(err) => Err(err),
            },
        }
    }

    pub async fn persist(&self, event: NormalizedEvent, detail_fetched: bool) -> Result<Outcome, StoreError> {
        let resolved = self.resolve(event, detail_fetched).await?;
        self.apply(resolved).await
    }
}
