//! HTTP control routes for operators and the dashboard.
//!
//! Errors use `{ "error": { "code": "...", "message": "..." } }`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use desk_core::SessionId;
use desk_store::{SessionFilter, SessionRow, StoreError};
use desk_telemetry::{LogQuery, LogRecord};

use crate::error::OrchestratorError;
use crate::orchestrator::SessionDetail;
use crate::server::AppState;

const MAX_LIST_LIMIT: u32 = 500;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, body: ErrorBody { code, message: message.into() } }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::UnknownSession(_) | OrchestratorError::UnknownTurn { .. } => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::SessionClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", what),
            other => {
                tracing::error!(error = %other, "store error in request");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.body }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let connections = state.hub.connections();
    Json(json!({
        "status": "healthy",
        "live_sessions": state.hub.live_count(),
        "connections": connections.connection_count(),
    }))
}

/// `GET /generate-session-id`
pub async fn generate_session_id() -> Json<Value> {
    Json(json!({ "session_id": SessionId::generate() }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub resolved: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// `GET /sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<SessionRow>> {
    let defaults = SessionFilter::default();
    let filter = SessionFilter {
        resolved: params.resolved,
        limit: params.limit.unwrap_or(defaults.limit).clamp(1, MAX_LIST_LIMIT),
        offset: params.offset.unwrap_or(defaults.offset),
    };
    Ok(Json(state.hub.store().list_sessions(&filter)?))
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ApiResult<SessionDetail> {
    Ok(Json(state.hub.describe(&id).await?))
}

/// `POST /override/{id}`
pub async fn enable_override(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Value> {
    let change = state.hub.enable_override(&id).await?;
    Ok(Json(json!({
        "session_id": id,
        "human_override": change.human_override,
        "changed": change.changed,
    })))
}

/// `DELETE /override/{id}`
pub async fn release_override(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Value> {
    let change = state.hub.release_override(&id).await?;
    Ok(Json(json!({
        "session_id": id,
        "human_override": change.human_override,
        "changed": change.changed,
    })))
}

/// `POST /sessions/{id}/resolve`
pub async fn resolve(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Value> {
    let resolved = state.hub.set_resolved(&id, Some(true)).await?;
    Ok(Json(json!({ "session_id": id, "resolved": resolved })))
}

/// `POST /sessions/{id}/toggle-resolve`
pub async fn toggle_resolve(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Value> {
    let resolved = state.hub.set_resolved(&id, None).await?;
    Ok(Json(json!({ "session_id": id, "resolved": resolved })))
}

/// `POST /sessions/{id}/flag/{turn_id}`
pub async fn toggle_flag(
    State(state): State<AppState>,
    Path((id, turn_id)): Path<(SessionId, u64)>,
) -> ApiResult<Value> {
    let flagged = state.hub.toggle_flag(&id, turn_id).await?;
    Ok(Json(json!({ "session_id": id, "turn_id": turn_id, "flagged": flagged })))
}

/// `POST /sessions/{id}/close`
pub async fn close_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Value> {
    state.hub.close(&id).await?;
    Ok(Json(json!({ "session_id": id, "closed": true })))
}

/// `GET /telemetry/logs`
pub async fn query_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Vec<LogRecord>> {
    let sink = state.log_sink.as_ref().ok_or_else(|| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "LOGS_DISABLED", "log persistence is disabled")
    })?;
    let records = sink
        .query(&query)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "LOG_QUERY_FAILED", e.to_string()))?;
    Ok(Json(records))
}
