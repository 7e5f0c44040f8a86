use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use festa_core::{ApprovalStatus, Category, EventRecord, NormalizedEvent, Region};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::{EventStore, StatusFilter, StoreError};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const SELECT_COLUMNS: &str = r#"
    SELECT id, source_id, dedupe_key, content_hash, title, category, region,
           start_date, end_date, location, is_free, price, image_url, organizer,
           description, website_url, source_url, approval_status, crawled_at,
           created_at, updated_at
      FROM events
"#;

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn filter_clause(filter: StatusFilter) -> (&'static str, Option<&'static str>) {
    match filter {
        StatusFilter::Any => ("TRUE", None),
        StatusFilter::Missing => ("approval_status IS NULL", None),
        StatusFilter::Is(status) => ("approval_status = $1", Some(status.as_str())),
    }
}

fn count_sql(filter: StatusFilter) -> (String, Option<&'static str>) {
    let (clause, status) = filter_clause(filter);
    (format!("SELECT COUNT(*) AS n FROM events WHERE {clause}"), status)
}

/// The limit binds after the status parameter when there is one.
fn list_sql(filter: StatusFilter) -> (String, Option<&'static str>) {
    let (clause, status) = filter_clause(filter);
    let limit_param = if status.is_some() { "$2" } else { "$1" };
    (
        format!("{SELECT_COLUMNS} WHERE {clause} ORDER BY created_at DESC, id LIMIT {limit_param}"),
        status,
    )
}

fn row_to_record(row: &PgRow) -> Result<EventRecord, StoreError> {
    let category: String = row.try_get("category")?;
    let region: String = row.try_get("region")?;
    let approval_status: Option<String> = row.try_get("approval_status")?;
    let approval_status = approval_status
        .map(|s| s.parse::<ApprovalStatus>())
        .transpose()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let event = NormalizedEvent {
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        category: category
            .parse::<Category>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        region: region
            .parse::<Region>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        start_date: row.try_get::<NaiveDate, _>("start_date")?,
        end_date: row.try_get::<Option<NaiveDate>, _>("end_date")?,
        location: row.try_get("location")?,
        is_free: row.try_get("is_free")?,
        price: row.try_get("price")?,
        image_url: row.try_get("image_url")?,
        organizer: row.try_get("organizer")?,
        description: row.try_get("description")?,
        website_url: row.try_get("website_url")?,
        source_url: row.try_get("source_url")?,
        approval_status,
        crawled_at: row.try_get::<DateTime<Utc>, _>("crawled_at")?,
    };

    Ok(EventRecord {
        id: row.try_get("id")?,
        dedupe_key: row.try_get("dedupe_key")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        event,
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn find_by_dedupe_key(
        &self,
        source_id: &str,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE source_id = $1 AND dedupe_key = $2");
        let row = sqlx::query(&sql)
            .bind(source_id)
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert(&self, dedupe_key: &str, event: &NormalizedEvent) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                id, source_id, dedupe_key, content_hash, title, category, region,
                start_date, end_date, location, is_free, price, image_url, organizer,
                description, website_url, source_url, approval_status, crawled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(id)
        .bind(&event.source_id)
        .bind(dedupe_key)
        .bind(event.content_hash())
        .bind(&event.title)
        .bind(event.category.as_str())
        .bind(event.region.as_str())
        .bind(event.start_date)
        .bind(event.end_date)
        .bind(&event.location)
        .bind(event.is_free)
        .bind(&event.price)
        .bind(&event.image_url)
        .bind(&event.organizer)
        .bind(&event.description)
        .bind(&event.website_url)
        .bind(&event.source_url)
        .bind(event.approval_status.map(|s| s.as_str()))
        .bind(event.crawled_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict {
                source_id: event.source_id.clone(),
                dedupe_key: dedupe_key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, id: Uuid, event: &NormalizedEvent) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
               SET content_hash = $2,
                   title = $3,
                   category = $4,
                   region = $5,
                   start_date = $6,
                   end_date = $7,
                   location = $8,
                   is_free = $9,
                   price = $10,
                   image_url = $11,
                   organizer = $12,
                   description = $13,
                   website_url = $14,
                   source_url = $15,
                   crawled_at = $16,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(event.content_hash())
        .bind(&event.title)
        .bind(event.category.as_str())
        .bind(event.region.as_str())
        .bind(event.start_date)
        .bind(event.end_date)
        .bind(&event.location)
        .bind(event.is_free)
        .bind(&event.price)
        .bind(&event.image_url)
        .bind(&event.organizer)
        .bind(&event.description)
        .bind(&event.website_url)
        .bind(&event.source_url)
        .bind(event.crawled_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn set_approval_status(
        &self,
        ids: &[Uuid],
        target: ApprovalStatus,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE events
               SET approval_status = $1,
                   updated_at = NOW()
             WHERE id = ANY($2)
               AND approval_status IS DISTINCT FROM $1
            "#,
        )
        .bind(target.as_str())
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_where(&self, filter: StatusFilter) -> Result<u64, StoreError> {
        let (sql, status) = count_sql(filter);
        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let row = query.fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn list_by_status(
        &self,
        filter: StatusFilter,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let (sql, status) = list_sql(filter);
        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let rows = query
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn repair_missing_status(&self, default: ApprovalStatus) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
               SET approval_status = $1,
                   updated_at = NOW()
             WHERE approval_status IS NULL
            "#,
        )
        .bind(default.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_filters_bind_their_parameter_first() {
        let (sql, status) = list_sql(StatusFilter::Is(ApprovalStatus::Approved));
        assert_eq!(status, Some("approved"));
        assert!(sql.contains("WHERE approval_status = $1"));
        assert!(sql.ends_with("LIMIT $2"));

        let (sql, status) = count_sql(StatusFilter::Is(ApprovalStatus::Pending));
        assert_eq!(status, Some("pending"));
        assert!(sql.ends_with("WHERE approval_status = $1"));
    }

    #[test]
    fn unparameterized_filters_bind_only_the_limit() {
        for filter in [StatusFilter::Any, StatusFilter::Missing] {
            let (sql, status) = list_sql(filter);
            assert_eq!(status, None);
            assert!(sql.ends_with("LIMIT $1"), "{sql}");
            assert!(!sql.contains("$2"), "{sql}");
        }
        let (sql, _) = count_sql(StatusFilter::Missing);
        assert!(sql.ends_with("WHERE approval_status IS NULL"));
        let (sql, _) = count_sql(StatusFilter::Any);
        assert!(sql.ends_with("WHERE TRUE"));
    }
}
