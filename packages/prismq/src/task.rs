//! Task, worker, and task-log models.
//!
//! Rows are plain typed records. JSON columns (`payload`, `compatibility`,
//! `capabilities`, `details`) are stored as UTF-8 text and parsed on read via
//! the accessor methods; nothing in the queue interprets a payload beyond
//! handing it to a handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use typed_builder::TypedBuilder;

use crate::error::QueueError;

/// Column list shared by every SELECT/RETURNING over `tasks`. The generated
/// `compat_empty` column is intentionally absent.
pub(crate) const TASK_COLUMNS: &str = "id, task_type, payload, priority, status, attempts, \
     max_attempts, compatibility, idempotency_key, locked_by, reserved_at_utc, \
     lease_until_utc, run_after_utc, finished_at_utc, created_at_utc, updated_at_utc, \
     error_message";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Leased,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    /// Terminal states admit no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLetter
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }

    /// All states, for stats aggregation.
    pub fn all() -> [TaskStatus; 6] {
        [
            TaskStatus::Queued,
            TaskStatus::Leased,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::DeadLetter,
        ]
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "leased" => Ok(TaskStatus::Leased),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(QueueError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

/// Severity of a task-log record. Stored as upper-case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[sqlx(rename = "DEBUG")]
    Debug,
    #[sqlx(rename = "INFO")]
    Info,
    #[sqlx(rename = "WARNING")]
    Warning,
    #[sqlx(rename = "ERROR")]
    Error,
}

/// A unit of work persisted in the queue.
///
/// `id` is assigned by the store (monotonic), so FIFO/LIFO order on id alone.
/// Lower `priority` means more urgent; the valid range is 1..=1000.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Task {
    #[builder(default = 0)]
    pub id: i64,
    #[builder(setter(into))]
    pub task_type: String,
    #[builder(default = String::from("{}"), setter(into))]
    pub payload: String,
    #[builder(default = 100)]
    pub priority: i32,
    #[builder(default)]
    pub status: TaskStatus,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default = String::from("{}"), setter(into))]
    pub compatibility: String,
    #[builder(default, setter(strip_option, into))]
    pub idempotency_key: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub reserved_at_utc: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub lease_until_utc: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub run_after_utc: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub finished_at_utc: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at_utc: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at_utc: DateTime<Utc>,
    #[builder(default, setter(strip_option, into))]
    pub error_message: Option<String>,
}

impl Task {
    /// Parse the payload column.
    pub fn payload(&self) -> Result<Value, QueueError> {
        serde_json::from_str(&self.payload).map_err(|source| QueueError::Serde {
            column: "payload",
            source,
        })
    }

    /// Parse the compatibility column as a capability-requirement map.
    pub fn compatibility(&self) -> Result<Map<String, Value>, QueueError> {
        if self.compatibility.is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&self.compatibility).map_err(|source| QueueError::Serde {
            column: "compatibility",
            source,
        })
    }

    /// Whether this row would be picked up by a claim at `now`, ignoring
    /// capability requirements. Mirrors the SQL claim predicate.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let lease_expired = matches!(self.status, TaskStatus::Leased | TaskStatus::Processing)
            && self.lease_until_utc.is_some_and(|until| until <= now);
        (self.status == TaskStatus::Queued || lease_expired)
            && self.run_after_utc <= now
            && self.attempts < self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Load a task by id.
    pub async fn find_by_id(id: i64, pool: &SqlitePool) -> Result<Self, QueueError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(QueueError::NotFound { task_id: id })
    }

    /// Insert this record, returning the stored row (with its assigned id).
    pub async fn insert(&self, pool: &SqlitePool) -> Result<Self, QueueError> {
        let sql = format!(
            "INSERT INTO tasks (task_type, payload, priority, status, attempts, max_attempts, \
             compatibility, idempotency_key, locked_by, reserved_at_utc, lease_until_utc, \
             run_after_utc, finished_at_utc, created_at_utc, updated_at_utc, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<_, Self>(&sql)
            .bind(&self.task_type)
            .bind(&self.payload)
            .bind(self.priority)
            .bind(self.status)
            .bind(self.attempts)
            .bind(self.max_attempts)
            .bind(&self.compatibility)
            .bind(&self.idempotency_key)
            .bind(&self.locked_by)
            .bind(self.reserved_at_utc)
            .bind(self.lease_until_utc)
            .bind(self.run_after_utc)
            .bind(self.finished_at_utc)
            .bind(self.created_at_utc)
            .bind(self.updated_at_utc)
            .bind(&self.error_message)
            .fetch_one(pool)
            .await?;
        Ok(task)
    }
}

/// Subset check: every key/value pair in `required` has an equal entry in
/// `offered`. Empty requirements match any worker.
pub fn capabilities_match(required: &Map<String, Value>, offered: &Map<String, Value>) -> bool {
    required
        .iter()
        .all(|(key, value)| offered.get(key) == Some(value))
}

/// An execution agent, tracked by its heartbeat.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub capabilities: String,
    pub heartbeat_utc: DateTime<Utc>,
}

impl Worker {
    /// Parse the capabilities column.
    pub fn capabilities(&self) -> Result<Map<String, Value>, QueueError> {
        serde_json::from_str(&self.capabilities).map_err(|source| QueueError::Serde {
            column: "capabilities",
            source,
        })
    }
}

/// Append-only structured log record attached to a task.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub log_id: i64,
    pub task_id: i64,
    pub at_utc: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<String>,
}

impl TaskLog {
    /// Append a log record. Fails if the task does not exist (FK).
    pub async fn append(
        pool: &SqlitePool,
        task_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<&Value>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO task_logs (task_id, at_utc, level, message, details) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(task_id)
        .bind(Utc::now())
        .bind(level)
        .bind(message)
        .bind(details.map(|value| value.to_string()))
        .execute(pool)
        .await?;
        Ok(())
    }

    /// All log records for a task, oldest first.
    pub async fn for_task(pool: &SqlitePool, task_id: i64) -> Result<Vec<TaskLog>, QueueError> {
        let logs = sqlx::query_as::<_, TaskLog>(
            "SELECT log_id, task_id, at_utc, level, message, details \
             FROM task_logs WHERE task_id = ?1 ORDER BY log_id ASC",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }
}
