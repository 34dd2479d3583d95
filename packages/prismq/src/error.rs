//! Structured error types for the queue.
//!
//! `QueueError` is pattern-matchable so callers can tell a transient busy
//! store from a corrupt row or a misconfigured registry. Handler failures are
//! plain `anyhow::Error` at the dispatch boundary and never appear here; the
//! engine folds them into task state instead of propagating them.

use thiserror::Error;

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store was busy past its busy-timeout. Retriable.
    #[error("queue store busy: {0}")]
    Busy(String),

    /// Driver-level failure: malformed row, constraint breakage, I/O.
    #[error("queue store error: {0}")]
    Store(#[source] sqlx::Error),

    /// A JSON column failed to parse.
    #[error("malformed JSON in {column}: {source}")]
    Serde {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// No handler registered for a task type. The message lists known types
    /// so the misconfiguration is debuggable from the log alone.
    #[error("no handler registered for task type '{task_type}' (known types: {})", known.join(", "))]
    HandlerNotRegistered {
        task_type: String,
        known: Vec<String>,
    },

    /// A handler is already registered for this type and override was not
    /// requested.
    #[error("handler already registered for task type '{task_type}'")]
    HandlerAlreadyRegistered { task_type: String },

    /// Invalid input to enqueue, registration, or config loading.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown task id.
    #[error("task {task_id} not found")]
    NotFound { task_id: i64 },

    /// Backup or maintenance filesystem failure.
    #[error("maintenance I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // SQLITE_BUSY (5) / SQLITE_LOCKED (6) surface once the
            // busy-timeout is exhausted; both are retriable.
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code == "5" || code == "6" || db.message().contains("database is locked") {
                return QueueError::Busy(db.message().to_string());
            }
        }
        QueueError::Store(err)
    }
}

impl QueueError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retriable(&self) -> bool {
        matches!(self, QueueError::Busy(_))
    }
}
