//! HTTP control plane for session lifecycle and persistence decisions.
//!
//! Strict by design, in contrast to the best-effort ingest path: every
//! operation either succeeds or returns a JSON `{error, status}` body.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use ctg_core::session::{
    CreateSessionRequest, SaveSessionRequest, SessionError, SessionManager, SessionResponse,
};

use crate::hub::{websocket_handler, Hub};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
    pub hub: Arc<Hub>,
}

/// Session control plane plus health and the WebSocket upgrade.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_handler))
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/:id/stop", post(stop_session))
        .route("/api/sessions/:id/save", post(save_session))
        .route("/api/sessions/:id/metrics", get(session_metrics))
        .route("/api/sessions/:id/data", get(session_data))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// POST /api/sessions
async fn create_session(
    State(state): State<ApiState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.manager.create_session(&request).await?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session,
            metrics: None,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/sessions?limit=50&offset=0
async fn list_sessions(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(50);
    let offset = params.offset.unwrap_or(0);

    let sessions = state.manager.list_sessions(limit, offset).await?;
    let count = sessions.len();
    Ok(Json(json!({
        "sessions": sessions,
        "count": count,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /api/sessions/{id}
async fn get_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.manager.get_session(&session_id).await?;
    // Metrics may not exist yet for a young session.
    let metrics = state.manager.session_metrics(&session_id).await.ok();

    Ok(Json(SessionResponse { session, metrics }))
}

/// POST /api/sessions/{id}/stop
async fn stop_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.stop_session(&session_id).await?;
    Ok(Json(json!({
        "message": "Session stopped successfully",
        "session_id": session_id,
    })))
}

/// POST /api/sessions/{id}/save
async fn save_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    request: Option<Json<SaveSessionRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let notes = request.map(|Json(body)| body.notes).unwrap_or_default();
    state.manager.save_session(&session_id, &notes).await?;
    Ok(Json(json!({
        "message": "Session saved successfully",
        "session_id": session_id,
    })))
}

/// DELETE /api/sessions/{id}
async fn delete_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.delete_session(&session_id).await?;
    Ok(Json(json!({
        "message": "Session deleted successfully",
        "session_id": session_id,
    })))
}

/// GET /api/sessions/{id}/metrics
async fn session_metrics(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let metrics = state.manager.session_metrics(&session_id).await?;
    Ok(Json(metrics))
}

/// GET /api/sessions/{id}/data
async fn session_data(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let data = state.manager.session_data(&session_id).await?;
    Ok(Json(data))
}

/// Control-plane failure, rendered as `{"error": ..., "status": ...}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::NotFound(format!("Session not found: {id}")),
            SessionError::NotActive { .. } => Self::Conflict(err.to_string()),
            SessionError::Store(inner) => {
                error!(err = %inner, "storage operation failed");
                Self::Internal("Storage operation failed".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Conflict(message) => (StatusCode::CONFLICT, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}
