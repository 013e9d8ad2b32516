//! Admin REST API over the engine.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{Engine, RecoveryReport, SystemStatus};
use crate::error::{Error, JobError, RegistryError};
use crate::jobs::NewJob;
use crate::workers::{WorkerConfig, WorkerPatch, WorkerStatus};

const DEFAULT_CANCEL_REASON: &str = "cancelled by operator";

/// Build the admin router.
pub fn admin_routes(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(system_status))
        .route("/api/workers", get(list_workers).post(add_worker))
        .route(
            "/api/workers/{id}",
            axum::routing::patch(update_worker).delete(remove_worker),
        )
        .route("/api/workers/{id}/active", post(set_worker_active))
        .route("/api/workers/{id}/verify", post(verify_worker))
        .route("/api/jobs", post(enqueue_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/fail", post(fail_job))
        .route("/api/engine/start", post(start_engine))
        .route("/api/engine/stop", post(stop_engine))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Crate errors rendered as JSON with a status code.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Registry(RegistryError::UnknownWorker { .. }) => StatusCode::NOT_FOUND,
            Error::Registry(RegistryError::DuplicateWorker { .. }) => StatusCode::CONFLICT,
            Error::Registry(RegistryError::InvalidWorker { .. }) => StatusCode::BAD_REQUEST,
            Error::Job(JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Job(JobError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            Error::Job(JobError::Contended { .. }) => StatusCode::CONFLICT,
            Error::Engine(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Admin request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_job_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid job ID"})),
        )
            .into_response()
    })
}

// ── Health & status ─────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn system_status(State(engine): State<Engine>) -> ApiResult<SystemStatus> {
    Ok(Json(engine.get_system_status().await?))
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn list_workers(State(engine): State<Engine>) -> impl IntoResponse {
    Json(engine.get_worker_status().await)
}

async fn add_worker(
    State(engine): State<Engine>,
    Json(config): Json<WorkerConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let status = engine.add_worker(config).await?;
    info!(worker_id = %status.id, "Worker added via admin API");
    Ok((StatusCode::CREATED, Json(status)))
}

async fn update_worker(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    Json(patch): Json<WorkerPatch>,
) -> ApiResult<WorkerStatus> {
    Ok(Json(engine.update_worker(&id, patch).await?))
}

async fn remove_worker(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> ApiResult<WorkerConfig> {
    let removed = engine.remove_worker(&id).await?;
    info!(worker_id = %id, "Worker removed via admin API");
    Ok(Json(removed))
}

#[derive(Debug, Deserialize)]
struct ActiveBody {
    active: bool,
}

async fn set_worker_active(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    Json(body): Json<ActiveBody>,
) -> ApiResult<WorkerStatus> {
    Ok(Json(engine.set_worker_active(&id, body.active).await?))
}

async fn verify_worker(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> ApiResult<WorkerStatus> {
    Ok(Json(engine.verify_worker(&id).await?))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn enqueue_job(
    State(engine): State<Engine>,
    Json(new_job): Json<NewJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = engine.enqueue(new_job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(State(engine): State<Engine>, Path(id): Path<String>) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match engine.get_job(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct FailBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn fail_job(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    body: Option<Json<FailBody>>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let reason = body
        .and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    let outcome = match engine.fail_job(id, &reason).await {
        Ok(outcome) => outcome,
        Err(e) => return ApiError(e).into_response(),
    };
    match engine.get_job(id).await {
        Ok(job) => Json(serde_json::json!({"result": outcome, "job": job})).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

// ── Engine lifecycle ────────────────────────────────────────────────────

async fn start_engine(State(engine): State<Engine>) -> ApiResult<RecoveryReport> {
    Ok(Json(engine.start().await?))
}

async fn stop_engine(State(engine): State<Engine>) -> ApiResult<serde_json::Value> {
    engine.stop().await?;
    Ok(Json(serde_json::json!({"running": false})))
}
