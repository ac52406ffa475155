//! HTTP 入口（feature `web`）
//!
//! POST /api/chat、GET /api/sessions/:id/transcript、POST /api/sessions/:id/close、
//! POST /api/sessions/:id/cancel、GET /api/metrics、GET /api/health。

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::agent::{ChatRequest, ChatService};
use crate::archive::ArchiveMetricsSnapshot;
use crate::core::ChatError;
use crate::react::TurnOutcome;
use crate::session::TranscriptMessage;

type ApiError = (StatusCode, String);

fn api_error(e: ChatError) -> ApiError {
    let status = match &e {
        ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::SessionClosed(_) => StatusCode::CONFLICT,
        ChatError::Model { .. } => StatusCode::BAD_GATEWAY,
        ChatError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::ConfigError(_) | ChatError::MissingCapability(_) | ChatError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

pub fn router(service: Arc<ChatService>) -> Router {
    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/sessions/:id/transcript", get(api_transcript))
        .route("/api/sessions/:id/close", post(api_close))
        .route("/api/sessions/:id/cancel", post(api_cancel))
        .route("/api/metrics", get(api_metrics))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(service)
}

async fn api_chat(
    State(service): State<Arc<ChatService>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnOutcome>, ApiError> {
    if req.session_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "session_id is required".to_string()));
    }
    if req.user_message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "user_message is required".to_string()));
    }
    // 客户端断开时 axum 丢弃该 future，ChatService 据此取消本轮
    service.start_turn(req).await.map(Json).map_err(api_error)
}

async fn api_transcript(
    State(service): State<Arc<ChatService>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TranscriptMessage>>, ApiError> {
    service.transcript(&id).await.map(Json).map_err(api_error)
}

async fn api_close(
    State(service): State<Arc<ChatService>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    service.close_session(&id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn api_cancel(
    State(service): State<Arc<ChatService>>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: service.cancel(&id),
    })
}

#[derive(Serialize)]
struct MetricsResponse {
    live_sessions: usize,
    archive: ArchiveMetricsSnapshot,
}

async fn api_metrics(State(service): State<Arc<ChatService>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        live_sessions: service.sessions().len().await,
        archive: service.archive_metrics(),
    })
}
