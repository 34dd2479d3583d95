//! Post-claim lifecycle: complete, fail-with-retry, dead-letter, lease renew.
//!
//! Attempts are charged at claim time, so `fail` only decides between
//! requeue-with-backoff and the dead-letter terminal. Every operation is
//! status-guarded: finalizing an already-terminal task is a no-op reported as
//! [`FinalizeOutcome::NoChange`], which is how a cancellation that landed
//! mid-flight survives the late finalize from the worker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::QueueError;
use crate::store::QueueStore;
use crate::task::Task;

/// Exponential backoff with uniform jitter.
///
/// `delay = min(initial * multiplier^(attempt-1), max_delay) * (1 ± jitter)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1). 0.2 means ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay before jitter. `attempt` is 1-based (the attempt
    /// that just failed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.initial.as_secs_f64() * self.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay for scheduling the next run.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

/// What a finalize operation actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Task moved to `completed`.
    Completed,
    /// Task requeued for retry; claimable again at the given instant.
    Retried { run_after_utc: DateTime<Utc> },
    /// Retry budget exhausted (or retry refused); task is `dead_letter`.
    DeadLettered,
    /// The task was already terminal; nothing changed.
    NoChange,
}

/// Writes terminal state for claimed tasks.
#[derive(Clone)]
pub struct Executor {
    store: QueueStore,
    backoff: BackoffPolicy,
}

impl Executor {
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(store: QueueStore, backoff: BackoffPolicy) -> Self {
        Self { store, backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Mark a leased task as successfully completed, clearing its lock.
    pub async fn complete(&self, task_id: i64) -> Result<FinalizeOutcome, QueueError> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE tasks SET \
                 status = 'completed', \
                 finished_at_utc = ?1, \
                 locked_by = NULL, \
                 reserved_at_utc = NULL, \
                 lease_until_utc = NULL, \
                 updated_at_utc = ?1 \
             WHERE id = ?2 AND status IN ('leased', 'processing')",
        )
        .bind(now)
        .bind(task_id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(FinalizeOutcome::Completed);
        }
        // Either the task is gone (NotFound) or it reached a state we must
        // not overwrite (terminal, or reclaimed back to queued).
        Task::find_by_id(task_id, self.store.pool()).await?;
        Ok(FinalizeOutcome::NoChange)
    }

    /// Record a handler failure. With `retry` and budget remaining the task
    /// goes back to `queued` after the backoff delay; otherwise it
    /// dead-letters. Terminal tasks are left untouched.
    pub async fn fail(
        &self,
        task_id: i64,
        error: &str,
        retry: bool,
    ) -> Result<FinalizeOutcome, QueueError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let task = {
            let sql = format!(
                "SELECT {} FROM tasks WHERE id = ?1",
                crate::task::TASK_COLUMNS
            );
            sqlx::query_as::<_, Task>(&sql)
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(QueueError::NotFound { task_id })?
        };

        if task.is_terminal() {
            return Ok(FinalizeOutcome::NoChange);
        }

        let outcome = if retry && task.attempts < task.max_attempts {
            let delay = self.backoff.delay(task.attempts.max(1) as u32);
            let run_after = now
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            sqlx::query(
                "UPDATE tasks SET \
                     status = 'queued', \
                     locked_by = NULL, \
                     reserved_at_utc = NULL, \
                     lease_until_utc = NULL, \
                     run_after_utc = ?1, \
                     error_message = ?2, \
                     updated_at_utc = ?3 \
                 WHERE id = ?4",
            )
            .bind(run_after)
            .bind(error)
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            FinalizeOutcome::Retried {
                run_after_utc: run_after,
            }
        } else {
            sqlx::query(
                "UPDATE tasks SET \
                     status = 'dead_letter', \
                     finished_at_utc = ?1, \
                     locked_by = NULL, \
                     reserved_at_utc = NULL, \
                     lease_until_utc = NULL, \
                     error_message = ?2, \
                     updated_at_utc = ?1 \
                 WHERE id = ?3",
            )
            .bind(now)
            .bind(error)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            FinalizeOutcome::DeadLettered
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Extend the lease on a running task without re-claiming. Long-running
    /// handlers call this to keep the stale-lease safety net off their back.
    pub async fn renew_lease(&self, task_id: i64, extension: Duration) -> Result<bool, QueueError> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(extension)
                .map_err(|_| QueueError::Validation("lease extension out of range".into()))?;
        let updated = sqlx::query(
            "UPDATE tasks SET lease_until_utc = ?1, updated_at_utc = ?2 \
             WHERE id = ?3 AND status IN ('leased', 'processing')",
        )
        .bind(lease_until)
        .bind(now)
        .bind(task_id)
        .execute(self.store.pool())
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Transition a freshly claimed task from `leased` to `processing` as the
    /// handler starts. Returns false if the lease was lost in between.
    pub async fn mark_processing(&self, task_id: i64) -> Result<bool, QueueError> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'processing', updated_at_utc = ?1 \
             WHERE id = ?2 AND status = 'leased'",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(self.store.pool())
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(6), Duration::from_secs(32));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(9), Duration::from_secs(256));
        assert_eq!(policy.base_delay(10), Duration::from_secs(300));
        assert_eq!(policy.base_delay(40), Duration::from_secs(300));
    }

    #[test]
    fn jittered_delay_stays_within_band() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(3).as_secs_f64();
            assert!((3.2..=4.8).contains(&delay), "delay {delay} outside ±20%");
        }
    }

    #[test]
    fn successive_base_delays_are_non_decreasing() {
        let policy = no_jitter();
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
