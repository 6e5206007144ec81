use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::history;
use crate::state::PipelineStateFile;
use crate::storage;

#[derive(Clone)]
pub struct AppState {
    history_dir: Arc<PathBuf>,
    state_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(history_dir: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            history_dir: Arc::new(history_dir.into()),
            state_path: Arc::new(state_path.into()),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.history_dir(), cfg.state_path())
    }
}

/// Read-only view over the history directory and the pipeline state file.
/// Every request reads from disk; writers replace files atomically.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/latest/{*entity}", get(latest))
        .route("/previous/{*entity}", get(previous))
        .route("/status", get(status))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Router over the configured data directory.
pub fn router(cfg: &AppConfig) -> Router {
    create_router(AppState::from_config(cfg))
}

enum ApiError {
    NotFound,
    BadEntity,
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        tracing::error!(error = %e, "read api: history unreadable");
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::BadEntity => (StatusCode::BAD_REQUEST, "invalid entity".to_string()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (code, Json(json!({ "error": msg }))).into_response()
    }
}

/// `eur_usd_news_synthesis` or `fedwatch/analysis` -> file under `root`.
/// Only plain relative components are accepted.
fn entity_path(root: &Path, entity: &str) -> Option<PathBuf> {
    let entity = entity.trim_start_matches('/');
    if entity.is_empty() {
        return None;
    }
    let rel = Path::new(entity);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    let mut path = root.join(rel);
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        let mut name = path.file_name()?.to_os_string();
        name.push(".json");
        path.set_file_name(name);
    }
    Some(path)
}

async fn latest(
    State(state): State<AppState>,
    UrlPath(entity): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let path = entity_path(&state.history_dir, &entity).ok_or(ApiError::BadEntity)?;
    history::latest::<Value>(&path)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn previous(
    State(state): State<AppState>,
    UrlPath(entity): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let path = entity_path(&state.history_dir, &entity).ok_or(ApiError::BadEntity)?;
    history::previous::<Value>(&path)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn status(State(state): State<AppState>) -> Result<Json<PipelineStateFile>, ApiError> {
    let file = storage::read_json::<PipelineStateFile>(&state.state_path)?.unwrap_or_default();
    Ok(Json(file))
}
