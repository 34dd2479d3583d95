//! Queue endpoints: enqueue, task view, cancel, stats, list.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use prismq::{CancelOutcome, ListFilter, NewTask, QueueStats, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::server::app::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub priority: Option<i32>,
    #[serde(default)]
    pub compatibility: Option<Map<String, Value>>,
    pub max_attempts: Option<i32>,
    pub run_after_utc: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub task_id: i64,
    pub status: TaskStatus,
    pub created_at_utc: DateTime<Utc>,
    pub message: String,
}

/// JSON view of a task with payload/compatibility parsed back into objects.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub compatibility: Value,
    pub idempotency_key: Option<String>,
    pub locked_by: Option<String>,
    pub reserved_at_utc: Option<DateTime<Utc>>,
    pub lease_until_utc: Option<DateTime<Utc>>,
    pub run_after_utc: DateTime<Utc>,
    pub finished_at_utc: Option<DateTime<Utc>>,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let payload = task.payload().unwrap_or(Value::Null);
        let compatibility = task
            .compatibility()
            .map(Value::Object)
            .unwrap_or(Value::Null);
        Self {
            id: task.id,
            task_type: task.task_type,
            payload,
            priority: task.priority,
            status: task.status,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            compatibility,
            idempotency_key: task.idempotency_key,
            locked_by: task.locked_by,
            reserved_at_utc: task.reserved_at_utc,
            lease_until_utc: task.lease_until_utc,
            run_after_utc: task.run_after_utc,
            finished_at_utc: task.finished_at_utc,
            created_at_utc: task.created_at_utc,
            updated_at_utc: task.updated_at_utc,
            error_message: task.error_message,
        }
    }
}

/// POST /queue/enqueue — 201 either way; duplicates are reported in the
/// message rather than as a conflict status.
pub async fn enqueue_handler(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let new_task = NewTask {
        task_type: request.task_type,
        payload: request.payload.unwrap_or_else(|| Value::Object(Map::new())),
        priority: request.priority.unwrap_or(prismq::queue::DEFAULT_PRIORITY),
        compatibility: request.compatibility.unwrap_or_default(),
        max_attempts: request
            .max_attempts
            .unwrap_or(prismq::queue::DEFAULT_MAX_ATTEMPTS),
        run_after_utc: request.run_after_utc,
        idempotency_key: request.idempotency_key,
    };

    let result = state.queue.enqueue(new_task).await?;
    let message = if result.is_created() {
        "enqueued".to_string()
    } else {
        "already exists".to_string()
    };
    let task = result.task();

    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse {
            task_id: task.id,
            status: task.status,
            created_at_utc: task.created_at_utc,
            message,
        }),
    ))
}

/// GET /queue/tasks/:id
pub async fn get_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskView>, ApiError> {
    let task = state.queue.status(task_id).await?;
    Ok(Json(TaskView::from(task)))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: i64,
    pub status: TaskStatus,
    pub message: String,
}

/// POST /queue/tasks/:id/cancel — terminal tasks come back 200 with a
/// "cannot cancel" message instead of an error.
pub async fn cancel_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<CancelResponse>, ApiError> {
    let outcome = state.queue.cancel(task_id).await?;
    let (status, message) = match outcome {
        CancelOutcome::Cancelled => (TaskStatus::Failed, "cancelled".to_string()),
        CancelOutcome::AlreadyTerminal(status) => (
            status,
            format!("cannot cancel: task is already {}", status.as_str()),
        ),
    };
    Ok(Json(CancelResponse {
        task_id,
        status,
        message,
    }))
}

/// GET /queue/stats
pub async fn queue_stats_handler(
    State(state): State<AppState>,
) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.queue.stats().await?))
}

#[derive(Debug, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub capabilities: Value,
    pub heartbeat_utc: DateTime<Utc>,
}

impl From<prismq::Worker> for WorkerView {
    fn from(worker: prismq::Worker) -> Self {
        let capabilities = worker
            .capabilities()
            .map(Value::Object)
            .unwrap_or(Value::Null);
        Self {
            worker_id: worker.worker_id,
            capabilities,
            heartbeat_utc: worker.heartbeat_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkersResponse {
    pub active: Vec<WorkerView>,
    pub stale: Vec<WorkerView>,
}

/// GET /queue/workers — active/stale partition under the default threshold.
pub async fn list_workers_handler(
    State(state): State<AppState>,
) -> Result<Json<WorkersResponse>, ApiError> {
    let active = state.heartbeat.active().await?;
    let stale = state.heartbeat.stale().await?;
    Ok(Json(WorkersResponse {
        active: active.into_iter().map(WorkerView::from).collect(),
        stale: stale.into_iter().map(WorkerView::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub limit: Option<i64>,
}

/// GET /queue/tasks?status=&type=&limit= — newest first.
pub async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let tasks = state
        .queue
        .list(ListFilter {
            status,
            task_type: query.task_type,
            limit: query.limit,
        })
        .await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}
