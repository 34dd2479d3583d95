//! Worker heartbeating, staleness detection, and task reclaim.
//!
//! Workers upsert a heartbeat row as they poll. A worker whose heartbeat is
//! older than the staleness threshold is presumed dead; its leased tasks go
//! back to the claimable pool with their retry budget untouched.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::QueueError;
use crate::store::QueueStore;
use crate::task::Worker;

/// Default staleness threshold: five minutes without a beat.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct WorkerHeartbeat {
    store: QueueStore,
    stale_threshold: Duration,
}

impl WorkerHeartbeat {
    pub fn new(store: QueueStore) -> Self {
        Self::with_threshold(store, DEFAULT_STALE_THRESHOLD)
    }

    pub fn with_threshold(store: QueueStore, stale_threshold: Duration) -> Self {
        Self {
            store,
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    fn cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(self.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    /// Record a heartbeat, creating the worker row on first contact.
    pub async fn beat(
        &self,
        worker_id: &str,
        capabilities: &Map<String, Value>,
    ) -> Result<(), QueueError> {
        let capabilities_json = Value::Object(capabilities.clone()).to_string();
        sqlx::query(
            "INSERT INTO workers (worker_id, capabilities, heartbeat_utc) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(worker_id) DO UPDATE SET \
                 capabilities = excluded.capabilities, \
                 heartbeat_utc = excluded.heartbeat_utc",
        )
        .bind(worker_id)
        .bind(capabilities_json)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Workers seen within the staleness threshold, most recent first.
    pub async fn active(&self) -> Result<Vec<Worker>, QueueError> {
        let workers = sqlx::query_as::<_, Worker>(
            "SELECT worker_id, capabilities, heartbeat_utc FROM workers \
             WHERE heartbeat_utc >= ?1 ORDER BY heartbeat_utc DESC",
        )
        .bind(self.cutoff())
        .fetch_all(self.store.pool())
        .await?;
        Ok(workers)
    }

    /// Workers not seen within the staleness threshold, oldest first.
    pub async fn stale(&self) -> Result<Vec<Worker>, QueueError> {
        let workers = sqlx::query_as::<_, Worker>(
            "SELECT worker_id, capabilities, heartbeat_utc FROM workers \
             WHERE heartbeat_utc < ?1 ORDER BY heartbeat_utc ASC",
        )
        .bind(self.cutoff())
        .fetch_all(self.store.pool())
        .await?;
        Ok(workers)
    }

    /// Return every task leased by a stale worker to the claimable pool.
    ///
    /// Locks are cleared and `attempts` is left as it was, so a crash does
    /// not eat into the retry budget beyond the claim that already happened.
    pub async fn reclaim_stale_tasks(&self) -> Result<u64, QueueError> {
        let reclaimed = sqlx::query(
            "UPDATE tasks SET \
                 status = 'queued', \
                 locked_by = NULL, \
                 reserved_at_utc = NULL, \
                 lease_until_utc = NULL, \
                 updated_at_utc = ?1 \
             WHERE status IN ('leased', 'processing') \
               AND locked_by IN (SELECT worker_id FROM workers WHERE heartbeat_utc < ?2)",
        )
        .bind(Utc::now())
        .bind(self.cutoff())
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed tasks from stale workers");
        }
        Ok(reclaimed)
    }

    /// Delete stale worker rows. Unless `force`, workers still holding
    /// leased tasks are kept so their tasks can be reclaimed first.
    pub async fn cleanup_stale_workers(&self, force: bool) -> Result<u64, QueueError> {
        let removed = if force {
            sqlx::query("DELETE FROM workers WHERE heartbeat_utc < ?1")
                .bind(self.cutoff())
                .execute(self.store.pool())
                .await?
                .rows_affected()
        } else {
            sqlx::query(
                "DELETE FROM workers WHERE heartbeat_utc < ?1 \
                 AND worker_id NOT IN ( \
                     SELECT locked_by FROM tasks \
                     WHERE status IN ('leased', 'processing') AND locked_by IS NOT NULL)",
            )
            .bind(self.cutoff())
            .execute(self.store.pool())
            .await?
            .rows_affected()
        };

        if removed > 0 {
            info!(count = removed, force, "removed stale workers");
        }
        Ok(removed)
    }
}
