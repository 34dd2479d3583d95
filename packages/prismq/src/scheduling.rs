//! Claim strategies: FIFO, LIFO, priority, and weighted-random.
//!
//! Every strategy claims through a single `UPDATE … WHERE id = (SELECT …)
//! RETURNING` statement. SQLite serializes writers, so the statement is the
//! atomicity boundary: no two concurrent callers can move the same row from
//! `queued` to `leased`. A zero-row update means no task was claimed.
//!
//! Capability matching runs inside the candidate subquery: a task matches a
//! worker when every key/value pair in its `compatibility` object has an
//! equal entry in the worker's capabilities JSON (checked with `json_each`).
//! The generated `compat_empty` column short-circuits the common
//! no-requirements case.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::QueueError;
use crate::store::QueueStore;
use crate::task::{Task, TASK_COLUMNS};

/// How a worker orders the claimable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    #[default]
    Fifo,
    Lifo,
    Priority,
    WeightedRandom,
}

impl SchedulingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingStrategy::Fifo => "fifo",
            SchedulingStrategy::Lifo => "lifo",
            SchedulingStrategy::Priority => "priority",
            SchedulingStrategy::WeightedRandom => "weighted_random",
        }
    }
}

impl FromStr for SchedulingStrategy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(SchedulingStrategy::Fifo),
            "lifo" => Ok(SchedulingStrategy::Lifo),
            "priority" => Ok(SchedulingStrategy::Priority),
            "weighted_random" => Ok(SchedulingStrategy::WeightedRandom),
            other => Err(QueueError::Validation(format!(
                "unknown scheduling strategy '{other}' (expected fifo, lifo, priority, or weighted_random)"
            ))),
        }
    }
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic claim over the store. Implementations must guarantee that no two
/// concurrent callers receive the same task.
#[async_trait]
pub trait TaskClaimer: Send + Sync {
    fn strategy(&self) -> SchedulingStrategy;

    /// Claim one task for `worker_id`, holding it until now + `lease`.
    /// Returns `None` when nothing in the claimable set matches the worker.
    async fn claim(
        &self,
        worker_id: &str,
        worker_capabilities: &Map<String, Value>,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError>;
}

/// Build the claimer for a strategy.
pub fn for_strategy(strategy: SchedulingStrategy, store: QueueStore) -> Box<dyn TaskClaimer> {
    match strategy {
        SchedulingStrategy::Fifo => Box::new(FifoClaimer { store }),
        SchedulingStrategy::Lifo => Box::new(LifoClaimer { store }),
        SchedulingStrategy::Priority => Box::new(PriorityClaimer { store }),
        SchedulingStrategy::WeightedRandom => Box::new(WeightedRandomClaimer::new(store)),
    }
}

/// The claimable predicate shared by every strategy. `now` and `caps` are the
/// placeholder names of the current-time and worker-capabilities parameters.
fn claimable_where(now: &str, caps: &str) -> String {
    format!(
        "(t.status = 'queued' OR (t.status IN ('leased', 'processing') AND t.lease_until_utc <= {now})) \
         AND t.run_after_utc <= {now} \
         AND t.attempts < t.max_attempts \
         AND (t.compat_empty OR NOT EXISTS ( \
             SELECT 1 FROM json_each(t.compatibility) AS req \
             WHERE json_extract({caps}, '$.' || req.key) IS NOT req.value))"
    )
}

fn capabilities_json(capabilities: &Map<String, Value>) -> String {
    Value::Object(capabilities.clone()).to_string()
}

fn lease_bounds(lease: Duration) -> Result<(DateTime<Utc>, DateTime<Utc>), QueueError> {
    let now = Utc::now();
    let lease = chrono::Duration::from_std(lease)
        .map_err(|_| QueueError::Validation("lease duration out of range".into()))?;
    if lease <= chrono::Duration::zero() {
        return Err(QueueError::Validation(
            "lease duration must be positive".into(),
        ));
    }
    Ok((now, now + lease))
}

/// Claim the best candidate under `order_by` in one atomic statement.
///
/// Parameters: ?1 worker id, ?2 now, ?3 worker capabilities JSON,
/// ?4 lease expiry.
async fn claim_ordered(
    store: &QueueStore,
    order_by: &str,
    worker_id: &str,
    worker_capabilities: &Map<String, Value>,
    lease: Duration,
) -> Result<Option<Task>, QueueError> {
    let (now, lease_until) = lease_bounds(lease)?;
    let sql = format!(
        "UPDATE tasks SET \
             status = 'leased', \
             locked_by = ?1, \
             reserved_at_utc = ?2, \
             lease_until_utc = ?4, \
             attempts = attempts + 1, \
             updated_at_utc = ?2 \
         WHERE id = ( \
             SELECT t.id FROM tasks t \
             WHERE {predicate} \
             ORDER BY {order_by} \
             LIMIT 1 \
         ) \
         RETURNING {TASK_COLUMNS}",
        predicate = claimable_where("?2", "?3"),
    );

    let task = sqlx::query_as::<_, Task>(&sql)
        .bind(worker_id)
        .bind(now)
        .bind(capabilities_json(worker_capabilities))
        .bind(lease_until)
        .fetch_optional(store.pool())
        .await?;

    Ok(task)
}

/// Oldest first: `id ASC`.
pub struct FifoClaimer {
    store: QueueStore,
}

#[async_trait]
impl TaskClaimer for FifoClaimer {
    fn strategy(&self) -> SchedulingStrategy {
        SchedulingStrategy::Fifo
    }

    async fn claim(
        &self,
        worker_id: &str,
        worker_capabilities: &Map<String, Value>,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError> {
        claim_ordered(&self.store, "t.id ASC", worker_id, worker_capabilities, lease).await
    }
}

/// Newest first: `id DESC`.
pub struct LifoClaimer {
    store: QueueStore,
}

#[async_trait]
impl TaskClaimer for LifoClaimer {
    fn strategy(&self) -> SchedulingStrategy {
        SchedulingStrategy::Lifo
    }

    async fn claim(
        &self,
        worker_id: &str,
        worker_capabilities: &Map<String, Value>,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError> {
        claim_ordered(&self.store, "t.id DESC", worker_id, worker_capabilities, lease).await
    }
}

/// Most urgent first (lower priority value wins), FIFO within a priority.
pub struct PriorityClaimer {
    store: QueueStore,
}

#[async_trait]
impl TaskClaimer for PriorityClaimer {
    fn strategy(&self) -> SchedulingStrategy {
        SchedulingStrategy::Priority
    }

    async fn claim(
        &self,
        worker_id: &str,
        worker_capabilities: &Map<String, Value>,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError> {
        claim_ordered(
            &self.store,
            "t.priority ASC, t.id ASC",
            worker_id,
            worker_capabilities,
            lease,
        )
        .await
    }
}

/// Probabilistic pick weighted by `1 / (priority + 1)`.
///
/// Fetches a bounded window of candidates in priority order, draws one by
/// weight, and attempts the atomic claim on that id. A lost race drops the
/// candidate and redraws; once the window is exhausted it is refreshed once
/// before giving up. Weights are strictly positive, so every candidate —
/// including the lowest priority — has non-zero probability on every draw.
pub struct WeightedRandomClaimer {
    store: QueueStore,
    window: i64,
}

impl WeightedRandomClaimer {
    const DEFAULT_WINDOW: i64 = 64;

    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            window: Self::DEFAULT_WINDOW,
        }
    }

    /// Bound the candidate window (memory guard for deep queues).
    pub fn with_window(store: QueueStore, window: i64) -> Self {
        Self {
            store,
            window: window.max(1),
        }
    }

    async fn fetch_candidates(
        &self,
        now: DateTime<Utc>,
        caps_json: &str,
    ) -> Result<Vec<(i64, i32)>, QueueError> {
        let sql = format!(
            "SELECT t.id, t.priority FROM tasks t \
             WHERE {predicate} \
             ORDER BY t.priority ASC, t.id ASC \
             LIMIT ?3",
            predicate = claimable_where("?1", "?2"),
        );
        let rows = sqlx::query_as::<_, (i64, i32)>(&sql)
            .bind(now)
            .bind(caps_json)
            .bind(self.window)
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows)
    }

    /// Claim a specific candidate, re-checking the claimable predicate so a
    /// raced-away row yields `None` instead of a double lease.
    async fn try_claim_id(
        &self,
        id: i64,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let (now, lease_until) = lease_bounds(lease)?;
        let sql = format!(
            "UPDATE tasks SET \
                 status = 'leased', \
                 locked_by = ?1, \
                 reserved_at_utc = ?2, \
                 lease_until_utc = ?3, \
                 attempts = attempts + 1, \
                 updated_at_utc = ?2 \
             WHERE id = ?4 \
               AND (status = 'queued' OR (status IN ('leased', 'processing') AND lease_until_utc <= ?2)) \
               AND run_after_utc <= ?2 \
               AND attempts < max_attempts \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(lease_until)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(task)
    }
}

#[async_trait]
impl TaskClaimer for WeightedRandomClaimer {
    fn strategy(&self) -> SchedulingStrategy {
        SchedulingStrategy::WeightedRandom
    }

    async fn claim(
        &self,
        worker_id: &str,
        worker_capabilities: &Map<String, Value>,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let caps_json = capabilities_json(worker_capabilities);
        let mut refreshed = false;

        loop {
            let mut candidates = self.fetch_candidates(Utc::now(), &caps_json).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            while !candidates.is_empty() {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|(_, priority)| 1.0 / (*priority as f64 + 1.0))
                    .collect();
                let total: f64 = weights.iter().sum();
                let draw = rand::rng().random_range(0.0..total);
                let picked = weighted_index(&weights, draw);
                let (id, _) = candidates.remove(picked);

                match self.try_claim_id(id, worker_id, lease).await? {
                    Some(task) => return Ok(Some(task)),
                    None => {
                        // Lost the race for this id; move to the next draw.
                        debug!(task_id = id, "weighted claim raced, redrawing");
                    }
                }
            }

            if refreshed {
                return Ok(None);
            }
            refreshed = true;
        }
    }
}

/// Index of the first candidate whose cumulative weight exceeds `draw`.
fn weighted_index(weights: &[f64], draw: f64) -> usize {
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if draw < cumulative {
            return i;
        }
    }
    weights.len() - 1
}
