//! HTTP API over the master's job and node views.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::MeshError;
use crate::master::{JobState, Master};
use crate::protocol::{JobId, JobSpec, Message};

#[derive(Clone)]
pub struct ApiState {
    pub master: Master,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<JobId>,
    error: Option<String>,
}

#[derive(Serialize)]
struct KillJobResponse {
    job_id: JobId,
    state: JobState,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(MeshError);

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MeshError::UnknownJob(_) | MeshError::UnknownNode(_) => StatusCode::NOT_FOUND,
            MeshError::InvalidJobSpec(_)
            | MeshError::UnknownRole(_)
            | MeshError::UnknownMessageType(_)
            | MeshError::Codec(_) => StatusCode::BAD_REQUEST,
            MeshError::InsufficientCapacity { .. } | MeshError::LedgerFull(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            MeshError::InvalidTransition { .. } | MeshError::DuplicateNodeId(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route(
            "/api/jobs/:id",
            get(job_status_handler).delete(kill_job_handler),
        )
        .route("/api/jobs/:id/results", get(job_results_handler))
        .route("/api/messages", post(message_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = server.await {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn list_nodes_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.master.nodes().await)
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.master.jobs().await)
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> impl IntoResponse {
    match state.master.create_job(spec).await {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                MeshError::LedgerFull(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(SubmitJobResponse {
                    success: false,
                    job_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.master.check_job(job_id).await?))
}

async fn kill_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let state = state.master.kill_job(job_id).await?;
    Ok(Json(KillJobResponse { job_id, state }))
}

async fn job_results_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.master.worker_results(job_id).await?))
}

/// Accept a raw protocol message as if it had arrived in the master inbox.
async fn message_handler(
    State(state): State<ApiState>,
    Json(raw): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let msg = Message::from_value(raw)?;
    tracing::debug!(kind = %msg.kind(), sender = %msg.sender, "Message submitted over HTTP");
    state.master.handle_message(msg).await;
    Ok(StatusCode::ACCEPTED)
}
