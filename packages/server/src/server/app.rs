//! Application state, router assembly, and the API error envelope.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prismq::{Maintenance, QueueError, QueueStore, TaskQueue, WorkerHeartbeat};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::server::routes::{
    cancel_task_handler, cleanup_runs_handler, cleanup_temp_files_handler, enqueue_handler,
    get_task_handler, health_check_handler, health_handler, list_tasks_handler,
    list_workers_handler, log_statistics_handler, queue_stats_handler,
};

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
    pub maintenance: Maintenance,
    pub heartbeat: WorkerHeartbeat,
    pub temp_dir: PathBuf,
}

impl AppState {
    pub fn new(store: QueueStore, backups_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            queue: TaskQueue::new(store.clone()),
            maintenance: Maintenance::new(store.clone(), backups_dir),
            heartbeat: WorkerHeartbeat::new(store),
            temp_dir,
        }
    }
}

/// Build the HTTP application over the queue.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/queue/enqueue", post(enqueue_handler))
        .route("/queue/tasks", get(list_tasks_handler))
        .route("/queue/tasks/:id", get(get_task_handler))
        .route("/queue/tasks/:id/cancel", post(cancel_task_handler))
        .route("/queue/stats", get(queue_stats_handler))
        .route("/queue/workers", get(list_workers_handler))
        .route("/system/maintenance/cleanup-runs", post(cleanup_runs_handler))
        .route("/system/maintenance/health-check", post(health_check_handler))
        .route(
            "/system/maintenance/cleanup-temp-files",
            post(cleanup_temp_files_handler),
        )
        .route(
            "/system/maintenance/log-statistics",
            post(log_statistics_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps queue errors onto HTTP statuses: invalid input is the caller's fault,
/// unknown ids are 404, a busy store is 503 (retriable), everything else is a
/// server error.
pub struct ApiError(pub QueueError);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::Validation(_) => StatusCode::BAD_REQUEST,
            QueueError::NotFound { .. } => StatusCode::NOT_FOUND,
            QueueError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
