//! API request handlers

use crate::events::{EventPipeline, PipelineStats};
use crate::items::{Item, ItemCreate, ItemError, ItemStore, ItemUpdate};
use crate::Config;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared server state
pub struct ServerState {
    pub store: Arc<ItemStore>,
    pub pipeline: Arc<EventPipeline>,
    pub config: Arc<Config>,
}

/// Shared state handle injected into every handler
pub type LiveState = Arc<ServerState>;

impl ServerState {
    /// Wire a fresh pipeline to a seeded store
    pub fn new(config: Config) -> Self {
        let pipeline = Arc::new(EventPipeline::new(config.pipeline_config()));
        let store = Arc::new(ItemStore::with_seed_data(pipeline.clone()));
        Self {
            store,
            pipeline,
            config: Arc::new(config),
        }
    }
}

// ============================================================================
// Health check
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub items: usize,
    pub events: PipelineStats,
}

pub async fn health(State(state): State<LiveState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        items: state.store.len().await,
        events: state.pipeline.stats(),
    })
}

// ============================================================================
// Items
// ============================================================================

/// GET /items
pub async fn list_items(State(state): State<LiveState>) -> Json<Vec<Item>> {
    Json(state.store.list().await)
}

/// GET /items/{item_id}
pub async fn get_item(
    State(state): State<LiveState>,
    Path(item_id): Path<u64>,
) -> Result<Json<Item>, AppError> {
    Ok(Json(state.store.get(item_id).await?))
}

/// POST /items
pub async fn create_item(
    State(state): State<LiveState>,
    payload: Result<Json<ItemCreate>, JsonRejection>,
) -> Result<(StatusCode, Json<Item>), AppError> {
    let Json(req) = payload?;
    let item = state.store.create(req).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// PUT /items/{item_id} (full replacement)
pub async fn replace_item(
    State(state): State<LiveState>,
    Path(item_id): Path<u64>,
    payload: Result<Json<ItemCreate>, JsonRejection>,
) -> Result<Json<Item>, AppError> {
    let Json(req) = payload?;
    Ok(Json(state.store.replace(item_id, req).await?))
}

/// PATCH /items/{item_id} (partial update)
pub async fn patch_item(
    State(state): State<LiveState>,
    Path(item_id): Path<u64>,
    payload: Result<Json<ItemUpdate>, JsonRejection>,
) -> Result<Json<Item>, AppError> {
    let Json(req) = payload?;
    Ok(Json(state.store.patch(item_id, req).await?))
}

/// DELETE /items/{item_id}
pub async fn delete_item(
    State(state): State<LiveState>,
    Path(item_id): Path<u64>,
) -> Result<StatusCode, AppError> {
    state.store.delete(item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Errors
// ============================================================================

/// API error type
#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
    Validation(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

/// Body extraction failures answer with the same JSON error shape
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => AppError::Validation(e.body_text()),
            other => AppError::BadRequest(other.body_text()),
        }
    }
}

impl From<ItemError> for AppError {
    fn from(err: ItemError) -> Self {
        match err {
            ItemError::Validation(msg) => AppError::Validation(msg),
            ItemError::NotFound(_) => AppError::NotFound(err.to_string()),
        }
    }
}
