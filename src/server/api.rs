use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::errors::OrchestratorError;
use crate::models::{AttachmentMeta, RunMode};
use crate::orchestrator::{CreateRunRequest, RunOrchestrator};
use crate::server::events::RunEvent;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<RunOrchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunBody {
    pub account_id: String,
    pub mode: String,
    pub challenge: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
}

#[derive(Deserialize, Default)]
pub struct ClarifyBody {
    pub answer: Option<String>,
    #[serde(default)]
    pub skip: bool,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    RateLimited { message: String, retry_after_secs: u64 },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            ApiError::RateLimited { message, retry_after_secs } => {
                (StatusCode::TOO_MANY_REQUESTS, message, Some(retry_after_secs))
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };
        let body = match retry_after {
            Some(secs) => serde_json::json!({"error": message, "retry_after_secs": secs}),
            None => serde_json::json!({"error": message}),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::RunNotFound { id } => {
                ApiError::NotFound(format!("Run {} not found", id))
            }
            OrchestratorError::AlreadyActive { id } => {
                ApiError::Conflict(format!("Run {} is already executing", id))
            }
            OrchestratorError::NotAwaitingClarification { id } => {
                ApiError::Conflict(format!("Run {} is not awaiting clarification", id))
            }
            OrchestratorError::InvalidTransition { .. } => {
                ApiError::Conflict("Run is in a conflicting state".to_string())
            }
            OrchestratorError::RateLimited { reason, retry_after_secs } => ApiError::RateLimited {
                message: reason,
                retry_after_secs,
            },
            OrchestratorError::BadRequest(msg) => ApiError::BadRequest(msg),
            OrchestratorError::Other(err) => {
                // Internal detail goes to the logs, not the client.
                tracing::error!(error = ?err, "Internal API error");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/status", get(get_status))
        .route("/api/runs/{id}/events", get(run_events))
        .route("/api/runs/{id}/clarify", post(clarify))
        .route("/api/accounts/{id}/usage", get(get_usage))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_run(
    State(state): State<SharedState>,
    Json(body): Json<CreateRunBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = RunMode::from_str(&body.mode).map_err(ApiError::BadRequest)?;
    let run = state
        .orchestrator
        .create_run(CreateRunRequest {
            account_id: body.account_id,
            mode,
            challenge: body.challenge,
            attachments: body.attachments,
        })
        .await?;
    state.orchestrator.trigger(&run.id).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.orchestrator.status_view(&id).await?;
    Ok(Json(view))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.orchestrator.run_detail(&id).await?;
    Ok(Json(detail))
}

async fn get_usage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.orchestrator.usage(&id).await?;
    Ok(Json(snapshot))
}

/// SSE stream of this run's events. Lagged subscribers silently drop
/// events; the status poll remains authoritative.
async fn run_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 for unknown runs before upgrading to a stream.
    state.orchestrator.status_view(&id).await?;
    Ok(event_stream(&state, id))
}

fn event_stream(state: &SharedState, run_id: String) -> Response {
    let rx = state.orchestrator.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) if event.run_id() == run_id => {
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok::<Event, Infallible>(Event::default().data(data)))
        }
        _ => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Answer (or skip) the pending clarification. With `Accept:
/// text/event-stream` the response streams run events after resuming;
/// otherwise it is a single-shot `{status}` JSON.
async fn clarify(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClarifyBody>,
) -> Result<Response, ApiError> {
    let answer = if body.skip {
        None
    } else {
        match body.answer {
            Some(answer) => Some(answer),
            None => {
                return Err(ApiError::BadRequest(
                    "Provide an answer or set skip to true".to_string(),
                ));
            }
        }
    };
    let run = state.orchestrator.answer_clarification(&id, answer).await?;

    let wants_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));
    if wants_stream {
        Ok(event_stream(&state, id))
    } else {
        Ok(Json(serde_json::json!({"status": run.status})).into_response())
    }
}
