//! Axum JSON API for moderating ingested events and triggering runs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use festa_core::{ApprovalStatus, EventPatch, Region};
use festa_ingest::{
    load_classifier, open_store, ApprovalError, ApprovalService, IngestConfig, IngestionPipeline,
};
use festa_storage::{EventStore, StatusFilter};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub approval: ApprovalService,
    /// `None` when no source registry could be loaded; run triggers then answer 503.
    pub pipeline: Option<Arc<IngestionPipeline>>,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, pipeline: Option<Arc<IngestionPipeline>>) -> Self {
        Self {
            approval: ApprovalService::new(store),
            pipeline,
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        let status = match &err {
            ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
            ApprovalError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ApprovalError::InvalidEdit(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApprovalError::Store(_) => {
                error!(error = %err, "store failure while handling request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/events", get(list_events_handler))
        .route("/events/counts", get(counts_handler))
        .route("/events/bulk-approve", post(bulk_approve_handler))
        .route("/events/{id}", get(get_event_handler).patch(edit_event_handler))
        .route("/events/{id}/approve", post(approve_handler))
        .route("/events/{id}/reject", post(reject_handler))
        .route("/categories", get(categories_handler))
        .route("/regions", get(regions_handler))
        .route("/admin/normalize-statuses", post(normalize_statuses_handler))
        .route("/ingestion/runs", post(trigger_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "moderation api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let store = open_store(&config).await?;
    let classifier = load_classifier(&config)?;
    let pipeline = match IngestionPipeline::new(&config, store.clone(), classifier) {
        Ok(pipeline) => Some(Arc::new(pipeline)),
        Err(err) => {
            warn!(error = %err, "ingestion trigger disabled");
            None
        }
    };
    serve(AppState::new(store, pipeline), config.web_port).await
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

fn parse_status_filter(raw: Option<&str>) -> Result<StatusFilter, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(StatusFilter::Is(ApprovalStatus::Pending)),
        Some("all") => Ok(StatusFilter::Any),
        Some("missing") => Ok(StatusFilter::Missing),
        Some(other) => other
            .parse::<ApprovalStatus>()
            .map(StatusFilter::Is)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string())),
    }
}

async fn list_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let filter = parse_status_filter(query.status.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let events = state.approval.list_by_status(filter, limit).await?;
    Ok(Json(events).into_response())
}

async fn counts_handler(State(state): State<Arc<AppState>>) -> ApiResult<festa_ingest::StatusCounts> {
    Ok(Json(state.approval.counts().await?))
}

async fn get_event_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<festa_core::EventRecord> {
    Ok(Json(state.approval.get(id).await?))
}

async fn edit_event_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<EventPatch>,
) -> ApiResult<festa_core::EventRecord> {
    Ok(Json(state.approval.edit_fields(id, &patch).await?))
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<festa_ingest::StatusChange> {
    Ok(Json(state.approval.set_status(id, ApprovalStatus::Approved).await?))
}

async fn reject_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<festa_ingest::StatusChange> {
    Ok(Json(state.approval.set_status(id, ApprovalStatus::Rejected).await?))
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    ids: Vec<Uuid>,
}

async fn bulk_approve_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkRequest>,
) -> ApiResult<festa_ingest::BulkStatusChange> {
    Ok(Json(
        state
            .approval
            .set_status_bulk(&body.ids, ApprovalStatus::Approved)
            .await?,
    ))
}

async fn normalize_statuses_handler(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let repaired = state.approval.normalize_legacy_statuses().await?;
    Ok(Json(serde_json::json!({ "repaired": repaired })))
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let Some(pipeline) = &state.pipeline else {
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "classifier not loaded"));
    };
    let classifier = pipeline.classifier();
    let categories: Vec<_> = classifier.categories().cloned().collect();
    Ok(Json(categories).into_response())
}

async fn regions_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let Some(pipeline) = &state.pipeline else {
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "classifier not loaded"));
    };
    let classifier = pipeline.classifier();
    let regions: Vec<_> = Region::ALL
        .into_iter()
        .filter_map(|code| {
            classifier
                .region_name(code)
                .map(|name| serde_json::json!({ "code": code, "name": name }))
        })
        .collect();
    Ok(Json(regions).into_response())
}

#[derive(Debug, Deserialize)]
struct TriggerQuery {
    #[serde(default)]
    wait: bool,
}

/// Starts a run in the background, or runs it inline with `?wait=true`.
async fn trigger_run_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TriggerQuery>,
) -> Result<Response, ApiError> {
    let Some(pipeline) = state.pipeline.clone() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "ingestion pipeline is not configured",
        ));
    };
    if query.wait {
        let summary = pipeline.run_ingestion().await;
        return Ok(Json(summary).into_response());
    }
    tokio::spawn(async move {
        pipeline.run_ingestion().await;
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "started" })),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{NaiveDate, Utc};
    use festa_core::{Category, NormalizedEvent, Region};
    use festa_ingest::Classifier;
    use festa_storage::InMemoryEventStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn event(seq: u32, status: Option<ApprovalStatus>) -> NormalizedEvent {
        NormalizedEvent {
            source_id: "expo-board".into(),
            title: format!("부산 불꽃축제 {seq}"),
            category: Category::Festival,
            region: Region::Busan,
            start_date: NaiveDate::from_ymd_opt(2025, 11, 15).unwrap(),
            end_date: None,
            location: "광안리 해수욕장".into(),
            is_free: true,
            price: "무료".into(),
            image_url: None,
            organizer: String::new(),
            description: String::new(),
            website_url: None,
            source_url: format!("https://expo.example.kr/view?seq={seq}"),
            approval_status: status,
            crawled_at: Utc::now(),
        }
    }

    async fn seeded() -> (Router, Vec<Uuid>) {
        let store = Arc::new(InMemoryEventStore::new());
        let mut ids = Vec::new();
        for (seq, status) in [
            (1, Some(ApprovalStatus::Pending)),
            (2, Some(ApprovalStatus::Pending)),
            (3, None),
        ] {
            let e = event(seq, status);
            ids.push(store.insert(&e.dedupe_key(), &e).await.unwrap());
        }
        let pipeline = IngestionPipeline::with_slots(
            &IngestConfig::default(),
            store.clone(),
            Classifier::builtin().unwrap(),
            Vec::new(),
        )
        .unwrap();
        (app(AppState::new(store, Some(Arc::new(pipeline)))), ids)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn healthz_answers() {
        let (app, _) = seeded().await;
        let (status, body) = send(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn pending_queue_is_the_default_listing() {
        let (app, _) = seeded().await;
        let (status, body) = send(&app, "GET", "/events", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, all) = send(&app, "GET", "/events?status=all&limit=1", None).await;
        assert_eq!(all.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "GET", "/events?status=maybe", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn approve_then_reject_round_trip() {
        let (app, ids) = seeded().await;
        let uri = format!("/events/{}/approve", ids[0]);
        let (status, body) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "approved");
        assert_eq!(body["changed"], true);

        let (_, again) = send(&app, "POST", &uri, None).await;
        assert_eq!(again["changed"], false);

        let (status, body) = send(&app, "POST", &format!("/events/{}/reject", ids[0]), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "rejected");

        let (_, record) = send(&app, "GET", &format!("/events/{}", ids[0]), None).await;
        assert_eq!(record["approval_status"], "rejected");
        assert_eq!(record["region"], "busan");
    }

    #[tokio::test]
    async fn unknown_event_is_404() {
        let (app, _) = seeded().await;
        let (status, body) = send(&app, "POST", &format!("/events/{}/approve", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn bulk_approve_and_counts() {
        let (app, ids) = seeded().await;
        let (status, body) = send(
            &app,
            "POST",
            "/events/bulk-approve",
            Some(serde_json::json!({ "ids": [ids[0], ids[1]] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], 2);

        let (_, counts) = send(&app, "GET", "/events/counts", None).await;
        assert_eq!(counts["approved"], 2);
        assert_eq!(counts["pending"], 0);
        assert_eq!(counts["missing"], 1);
    }

    #[tokio::test]
    async fn normalize_statuses_repairs_once() {
        let (app, _) = seeded().await;
        let (_, first) = send(&app, "POST", "/admin/normalize-statuses", None).await;
        assert_eq!(first["repaired"], 1);
        let (_, second) = send(&app, "POST", "/admin/normalize-statuses", None).await;
        assert_eq!(second["repaired"], 0);
    }

    #[tokio::test]
    async fn patch_validates_edits() {
        let (app, ids) = seeded().await;
        let uri = format!("/events/{}", ids[0]);
        let (status, body) = send(
            &app,
            "PATCH",
            &uri,
            Some(serde_json::json!({ "title": "광안리 불꽃축제", "end_date": "2025-11-16" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "광안리 불꽃축제");
        assert_eq!(body["end_date"], "2025-11-16");

        let (status, _) = send(&app, "PATCH", &uri, Some(serde_json::json!({ "end_date": "2025-01-01" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn trigger_run_inline_returns_summary() {
        let (app, _) = seeded().await;
        let (status, body) = send(&app, "POST", "/ingestion/runs?wait=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_inserted"], 0);
        assert!(body["adapters"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn trigger_without_pipeline_is_unavailable() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let app = app(AppState::new(store, None));
        let (status, _) = send(&app, "POST", "/ingestion/runs", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn categories_expose_metadata() {
        let (app, _) = seeded().await;
        let (status, body) = send(&app, "GET", "/categories", None).await;
        assert_eq!(status, StatusCode::OK);
        let codes: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["code"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(codes.first().map(String::as_str), Some("contest"));
        assert!(codes.contains(&"other".to_string()));
    }

    #[tokio::test]
    async fn regions_expose_display_names() {
        let (app, _) = seeded().await;
        let (status, body) = send(&app, "GET", "/regions", None).await;
        assert_eq!(status, StatusCode::OK);
        let regions = body.as_array().unwrap();
        assert_eq!(regions.len(), Region::ALL.len());
        let jeju = regions.iter().find(|r| r["code"] == "jeju").unwrap();
        assert_eq!(jeju["name"], "제주");
    }
}
