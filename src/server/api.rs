use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::phase::PhaseDefinition;
use crate::run::RunId;
use crate::service::PipelineService;

use super::sse;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: Arc<PipelineService>,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub requirement: String,
}

#[derive(Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
}

#[derive(Serialize, Deserialize)]
pub struct RunActionResponse {
    pub run_id: RunId,
    pub status: String,
}

#[derive(Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub filename: String,
    pub content: String,
}

#[derive(Serialize, Deserialize)]
pub struct PhasesResponse {
    pub phases: Vec<PhaseDefinition>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            PipelineError::RunNotFound { .. } => ApiError::NotFound(err.to_string()),
            PipelineError::RunAlreadyActive { .. } | PipelineError::RunAlreadyFinished { .. } => {
                ApiError::Conflict(err.to_string())
            }
            other => {
                tracing::error!(error = %other, "Request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Ids that do not parse can never name a run.
pub(super) fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("Run {} not found", raw)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/start", post(start_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/artifacts/{file}", get(get_artifact))
        .route("/api/runs/{id}/events", get(sse::run_events))
        .route("/api/phases", get(list_phases))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state.service.register(&req.requirement)?;
    tracing::info!(run_id = %run_id, "Run created");
    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })))
}

async fn start_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    state.service.start(run_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunActionResponse {
            run_id,
            status: "started".to_string(),
        }),
    ))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    let requested = state.service.cancel(run_id).await?;
    let status = if requested { "cancelling" } else { "already_finished" };
    Ok((
        StatusCode::ACCEPTED,
        Json(RunActionResponse {
            run_id,
            status: status.to_string(),
        }),
    ))
}

async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.service.history().await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    let detail = state.service.detail(run_id).await?;
    Ok(Json(detail))
}

async fn get_artifact(
    State(state): State<SharedState>,
    Path((id, file)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    match state.service.artifact(run_id, &file).await? {
        Some(content) => Ok(Json(ArtifactResponse {
            filename: file,
            content,
        })),
        None => Err(ApiError::NotFound(format!(
            "Artifact {} not found for run {}",
            file, run_id
        ))),
    }
}

async fn list_phases(State(state): State<SharedState>) -> impl IntoResponse {
    Json(PhasesResponse {
        phases: state.service.topology().phases().to_vec(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
