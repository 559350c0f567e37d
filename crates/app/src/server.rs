//! HTTP surface over ingestion control, the document library and retrieval.

use crate::config::Retriever;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use office_search_core::{
    ControlOutcome, DocumentLibrary, FileOpError, IngestionManager, ListDocumentsResult,
    RunSnapshot, SearchDocumentsResult, StoredDocument,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub retriever: Arc<Retriever>,
    pub manager: Arc<IngestionManager>,
    pub library: Arc<DocumentLibrary>,
}

/// `body_limit` bounds request bodies, which carry uploads as base64.
pub fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingestion/start", post(start_ingestion))
        .route("/ingestion/status", get(ingestion_status))
        .route("/ingestion/stop", post(stop_ingestion))
        .route("/documents", get(list_documents).post(upload_document))
        .route("/documents/{*filename}", delete(delete_document))
        .route("/search", post(search))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Observes ingestion exit even when nobody is reading the status.
pub fn spawn_liveness_poll(manager: Arc<IngestionManager>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            manager.poll();
        }
    });
}

#[derive(Debug)]
pub enum AppError {
    FileOp(FileOpError),
    BadRequest(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl From<FileOpError> for AppError {
    fn from(error: FileOpError) -> Self {
        AppError::FileOp(error)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::FileOp(error) => {
                let status = match &error {
                    FileOpError::Locked => StatusCode::LOCKED,
                    FileOpError::UnsupportedType(_) | FileOpError::InvalidName(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    FileOpError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    FileOpError::AlreadyExists(_) => StatusCode::CONFLICT,
                    FileOpError::NotFound(_) => StatusCode::NOT_FOUND,
                    FileOpError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, error.outcome_code(), error.to_string())
            }
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            AppError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };
        if status.is_server_error() {
            warn!(code, %message, "request failed");
        } else {
            debug!(code, %message, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: ErrorDetail { code, message },
            }),
        )
            .into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn start_ingestion(State(state): State<AppState>) -> Json<ControlOutcome> {
    Json(state.manager.start())
}

async fn ingestion_status(State(state): State<AppState>) -> Json<RunSnapshot> {
    Json(state.manager.status())
}

async fn stop_ingestion(State(state): State<AppState>) -> Json<ControlOutcome> {
    Json(state.manager.stop().await)
}

async fn list_documents(State(state): State<AppState>) -> Json<ListDocumentsResult> {
    Json(state.retriever.list_documents().await)
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    /// Base64-encoded file bytes.
    pub content: String,
}

async fn upload_document(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<(StatusCode, Json<StoredDocument>), AppError> {
    let bytes = STANDARD
        .decode(request.content.as_bytes())
        .map_err(|error| AppError::BadRequest(format!("content is not valid base64: {error}")))?;

    let library = Arc::clone(&state.library);
    let stored = tokio::task::spawn_blocking(move || library.upload(&request.filename, &bytes))
        .await
        .map_err(|error| AppError::Internal(error.to_string()))??;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<Value>, AppError> {
    let library = Arc::clone(&state.library);
    let target = filename.clone();
    tokio::task::spawn_blocking(move || library.delete(&target))
        .await
        .map_err(|error| AppError::Internal(error.to_string()))??;
    Ok(Json(json!({ "success": true, "filename": filename })))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    pub max_results: Option<i64>,
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchDocumentsResult>, AppError> {
    if request.query.trim().is_empty() {
        return Err(AppError::BadRequest("Query is required".to_string()));
    }
    let result = state
        .retriever
        .search_documents(&request.query, request.max_results.unwrap_or(5))
        .await;
    Ok(Json(result))
}
