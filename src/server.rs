use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::*;

use crate::queue::TaskQueue;
use crate::{JobRequest, QueueStats};

/// Read-only projections of queue state, plus the thin producer endpoint.
/// None of these synchronize with the workers; they observe whatever the
/// store holds at the instant of the request.
pub fn router(queue: TaskQueue) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/job-status/{id}", get(job_status))
        .route("/queue-stats", get(queue_stats))
        .route("/health", get(health))
        .with_state(queue)
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(message = "Request failed", error = ?self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

async fn submit_job(
    State(queue): State<TaskQueue>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, AppError> {
    let job_id = queue.enqueue(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": job_id }))))
}

async fn job_status(
    State(queue): State<TaskQueue>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    match queue.get_status(&id).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "job not found" })),
        )
            .into_response()),
    }
}

async fn queue_stats(State(queue): State<TaskQueue>) -> Result<Json<QueueStats>, AppError> {
    Ok(Json(queue.stats().await?))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    broker_connected: bool,
    pending_length: usize,
    in_flight_count: usize,
    dead_letter_length: usize,
}

/// Never errors; a dead broker turns into an "unhealthy" payload.
async fn health(State(queue): State<TaskQueue>) -> (StatusCode, Json<HealthResponse>) {
    let mut response = HealthResponse {
        status: "healthy",
        broker_connected: false,
        pending_length: 0,
        in_flight_count: 0,
        dead_letter_length: 0,
    };

    match queue.ping().await {
        Ok(()) => {
            response.broker_connected = true;
            if let Ok(stats) = queue.stats().await {
                response.pending_length = stats.pending_length;
                response.in_flight_count = stats.in_flight_count;
            }
            if let Ok(length) = queue.dead_letter_length().await {
                response.dead_letter_length = length;
            }
        }
        Err(err) => {
            warn!(message = "Broker ping failed", error = ?err);
            response.status = "unhealthy";
        }
    }

    let code = if response.broker_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
