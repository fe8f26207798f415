//! Operations HTTP surface: health, cache inspection and control, and
//! read-through access to every registered query.

mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::application::error::HttpError;
use crate::cache::{CacheStats, EntityType, OperationKind, WarmReport};
use crate::infra::cache::ContentCache;

pub use middleware::log_responses;

const SOURCE: &str = "infra::http";

#[derive(Clone)]
pub struct OpsState {
    pub cache: Arc<ContentCache>,
}

impl OpsState {
    pub fn new(cache: Arc<ContentCache>) -> Self {
        Self { cache }
    }
}

pub fn build_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/invalidate", post(invalidate))
        .route("/cache/warm", post(warm))
        .route("/cache/memory/clear", post(clear_memory))
        .route("/content/{entity}/{kind}", get(content))
        .layer(axum::middleware::from_fn(log_responses))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn cache_stats(State(state): State<OpsState>) -> Json<CacheStats> {
    Json(state.cache.manager().get_cache_stats())
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    entity: String,
    #[serde(default)]
    id: Option<Value>,
}

async fn invalidate(
    State(state): State<OpsState>,
    Json(request): Json<InvalidateRequest>,
) -> StatusCode {
    let id = match request.id {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    state
        .cache
        .manager()
        .invalidate(&request.entity, id.as_deref())
        .await;
    StatusCode::NO_CONTENT
}

async fn warm(State(state): State<OpsState>) -> Json<WarmReport> {
    Json(state.cache.manager().warm_critical_caches().await)
}

async fn clear_memory(State(state): State<OpsState>) -> StatusCode {
    state.cache.manager().clear_all_memory_caches();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Default, Deserialize)]
struct ContentParams {
    /// JSON-encoded query arguments.
    args: Option<String>,
}

async fn content(
    State(state): State<OpsState>,
    Path((entity, kind)): Path<(String, String)>,
    Query(params): Query<ContentParams>,
) -> Result<Json<Value>, HttpError> {
    let entity: EntityType = entity
        .parse()
        .map_err(|err| HttpError::from_error(SOURCE, StatusCode::NOT_FOUND, "Unknown query", &err))?;
    let kind: OperationKind = kind
        .parse()
        .map_err(|err| HttpError::from_error(SOURCE, StatusCode::NOT_FOUND, "Unknown query", &err))?;

    let args = match params.args.as_deref() {
        Some(raw) => serde_json::from_str(raw).map_err(|err| {
            HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Invalid query arguments",
                &err,
            )
        })?,
        None => json!({}),
    };

    let value = state.cache.cached_query(entity, kind, args).await?;
    Ok(Json(value))
}
