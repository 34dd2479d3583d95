//! The enqueue-side API: idempotent insert, status, cancel, stats, list.
//!
//! Idempotency is two-layered: a pre-select on the key returns the existing
//! task without inserting, and the unique index catches the race where two
//! enqueues with the same key interleave — the loser re-selects and reports
//! a duplicate instead of an error.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use typed_builder::TypedBuilder;

use crate::error::QueueError;
use crate::store::QueueStore;
use crate::task::{LogLevel, Task, TaskLog, TaskStatus, TASK_COLUMNS};

pub const DEFAULT_PRIORITY: i32 = 100;
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 1000;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const MAX_LIST_LIMIT: i64 = 1000;

/// Parameters for a new task.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewTask {
    #[builder(setter(into))]
    pub task_type: String,
    #[builder(default = Value::Object(Map::new()))]
    pub payload: Value,
    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i32,
    #[builder(default)]
    pub compatibility: Map<String, Value>,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
    /// Earliest claim instant; defaults to now.
    #[builder(default, setter(strip_option))]
    pub run_after_utc: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option, into))]
    pub idempotency_key: Option<String>,
}

/// Result of an enqueue, distinguishing a fresh insert from an idempotency
/// hit.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    Created(Task),
    Duplicate(Task),
}

impl EnqueueResult {
    /// The task record regardless of how it was obtained.
    pub fn task(&self) -> &Task {
        match self {
            EnqueueResult::Created(task) | EnqueueResult::Duplicate(task) => task,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task().id
    }

    /// True when a row was actually inserted.
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task moved to `failed` with "Cancelled by user".
    Cancelled,
    /// Task had already reached a terminal state; nothing changed.
    AlreadyTerminal(TaskStatus),
}

/// Aggregate queue counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    /// Age of the oldest still-queued task, if any.
    pub oldest_queued_age_seconds: Option<i64>,
}

/// Filters for [`TaskQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<i64>,
}

/// Enqueue-side handle over the store.
#[derive(Clone)]
pub struct TaskQueue {
    store: QueueStore,
}

impl TaskQueue {
    pub fn new(store: QueueStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    fn validate(new_task: &NewTask) -> Result<(), QueueError> {
        if new_task.task_type.trim().is_empty() {
            return Err(QueueError::Validation("task type must be non-empty".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&new_task.priority) {
            return Err(QueueError::Validation(format!(
                "priority {} out of range [{MIN_PRIORITY}, {MAX_PRIORITY}]",
                new_task.priority
            )));
        }
        if new_task.max_attempts < 1 {
            return Err(QueueError::Validation(format!(
                "max_attempts must be >= 1, got {}",
                new_task.max_attempts
            )));
        }
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, QueueError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE idempotency_key = ?1 LIMIT 1");
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(key)
            .fetch_optional(self.store.pool())
            .await?)
    }

    /// Insert a task, or return the existing one when the idempotency key is
    /// already present.
    pub async fn enqueue(&self, new_task: NewTask) -> Result<EnqueueResult, QueueError> {
        Self::validate(&new_task)?;

        if let Some(key) = &new_task.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let now = Utc::now();
        let row = Task::builder()
            .task_type(new_task.task_type)
            .payload(new_task.payload.to_string())
            .priority(new_task.priority)
            .max_attempts(new_task.max_attempts)
            .compatibility(Value::Object(new_task.compatibility).to_string())
            .run_after_utc(new_task.run_after_utc.unwrap_or(now))
            .created_at_utc(now)
            .updated_at_utc(now)
            .build();
        let row = Task {
            idempotency_key: new_task.idempotency_key.clone(),
            ..row
        };

        match row.insert(self.store.pool()).await {
            Ok(task) => Ok(EnqueueResult::Created(task)),
            Err(QueueError::Store(sqlx::Error::Database(db))) if db.is_unique_violation() => {
                // Lost the race on the idempotency key; hand back the winner.
                let key = new_task
                    .idempotency_key
                    .as_deref()
                    .unwrap_or_default();
                let existing = self.find_by_idempotency_key(key).await?.ok_or(
                    QueueError::Validation(format!(
                        "idempotency key '{key}' collided but no task found"
                    )),
                )?;
                Ok(EnqueueResult::Duplicate(existing))
            }
            Err(other) => Err(other),
        }
    }

    /// Fetch a task by id.
    pub async fn status(&self, task_id: i64) -> Result<Task, QueueError> {
        Task::find_by_id(task_id, self.store.pool()).await
    }

    /// Cancel a non-terminal task. Terminal tasks are reported, not mutated.
    pub async fn cancel(&self, task_id: i64) -> Result<CancelOutcome, QueueError> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE tasks SET \
                 status = 'failed', \
                 error_message = 'Cancelled by user', \
                 finished_at_utc = ?1, \
                 locked_by = NULL, \
                 reserved_at_utc = NULL, \
                 lease_until_utc = NULL, \
                 updated_at_utc = ?1 \
             WHERE id = ?2 AND status IN ('queued', 'leased', 'processing')",
        )
        .bind(now)
        .bind(task_id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(CancelOutcome::Cancelled);
        }
        let task = Task::find_by_id(task_id, self.store.pool()).await?;
        Ok(CancelOutcome::AlreadyTerminal(task.status))
    }

    /// Total, per-status counts, and the age of the oldest queued task.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(self.store.pool())
            .await?;

        let mut by_status: BTreeMap<String, i64> = TaskStatus::all()
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let mut total = 0;
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("n");
            total += count;
            by_status.insert(status, count);
        }

        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(created_at_utc) FROM tasks WHERE status = 'queued'",
        )
        .fetch_one(self.store.pool())
        .await?;
        let oldest_queued_age_seconds =
            oldest.map(|created| (Utc::now() - created).num_seconds().max(0));

        Ok(QueueStats {
            total,
            by_status,
            oldest_queued_age_seconds,
        })
    }

    /// List tasks, newest first, optionally filtered by status and type.
    /// The limit is clamped to 1..=1000.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Task>, QueueError> {
        let limit = filter.limit.unwrap_or(100).clamp(1, MAX_LIST_LIMIT);
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?1");
        }
        if filter.task_type.is_some() {
            sql.push_str(" AND task_type = ?2");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?3");

        let tasks = sqlx::query_as::<_, Task>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.task_type)
            .bind(limit)
            .fetch_all(self.store.pool())
            .await?;
        Ok(tasks)
    }

    /// Explicit admin delete. Task logs cascade.
    pub async fn delete(&self, task_id: i64) -> Result<bool, QueueError> {
        let deleted = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(task_id)
            .execute(self.store.pool())
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    /// Append a structured log record to a task.
    pub async fn append_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<&Value>,
    ) -> Result<(), QueueError> {
        TaskLog::append(self.store.pool(), task_id, level, message, details).await
    }

    /// All log records for a task, oldest first.
    pub async fn logs(&self, task_id: i64) -> Result<Vec<TaskLog>, QueueError> {
        TaskLog::for_task(self.store.pool(), task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_result_helpers() {
        let task = Task::builder().task_type("render").build();
        let created = EnqueueResult::Created(task.clone());
        assert!(created.is_created());

        let duplicate = EnqueueResult::Duplicate(task);
        assert!(!duplicate.is_created());
        assert_eq!(created.task_id(), duplicate.task_id());
    }

    #[test]
    fn validation_rejects_bad_input() {
        let empty_type = NewTask::builder().task_type("  ").build();
        assert!(matches!(
            TaskQueue::validate(&empty_type),
            Err(QueueError::Validation(_))
        ));

        let bad_priority = NewTask::builder().task_type("render").priority(0).build();
        assert!(matches!(
            TaskQueue::validate(&bad_priority),
            Err(QueueError::Validation(_))
        ));

        let high_priority = NewTask::builder()
            .task_type("render")
            .priority(1001)
            .build();
        assert!(matches!(
            TaskQueue::validate(&high_priority),
            Err(QueueError::Validation(_))
        ));

        let bad_attempts = NewTask::builder()
            .task_type("render")
            .max_attempts(0)
            .build();
        assert!(matches!(
            TaskQueue::validate(&bad_attempts),
            Err(QueueError::Validation(_))
        ));

        let ok = NewTask::builder().task_type("render").build();
        assert!(TaskQueue::validate(&ok).is_ok());
    }

    #[test]
    fn priority_bounds_are_inclusive() {
        for priority in [MIN_PRIORITY, MAX_PRIORITY] {
            let new_task = NewTask::builder()
                .task_type("render")
                .priority(priority)
                .build();
            assert!(TaskQueue::validate(&new_task).is_ok());
        }
    }
}
