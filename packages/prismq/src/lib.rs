//! # PrismQ
//!
//! A persistent task queue on SQLite with atomic worker leasing, pluggable
//! scheduling, exponential-backoff retries with a dead-letter terminal,
//! capability-aware dispatch, stale-lease recovery, and worker heartbeating.
//!
//! ## Architecture
//!
//! ```text
//! TaskQueue.enqueue()                WorkerEngine (one per worker)
//!     │                                  │
//!     ▼                                  ├─► heartbeat.beat()
//! ┌─────────── SQLite (WAL) ──────────┐  ├─► claimer.claim() ── atomic
//! │ tasks / workers / task_logs      ◄┼──┤       UPDATE queued → leased
//! └───────────────────────────────────┘  ├─► registry.get(type) → handler
//!     ▲                                  ├─► handler(task, cancel_token)
//!     │                                  └─► executor.complete / fail
//! Maintenance (on demand):                       │
//!   checkpoint / vacuum / backups               retry w/ backoff
//!   stale-lease sweep / retention               or dead_letter
//! ```
//!
//! ## Key invariants
//!
//! 1. **Claims are atomic** — a single serialized `UPDATE … RETURNING` moves
//!    a task from `queued` to `leased`; no two workers ever hold one task.
//! 2. **Attempts are charged at claim** — `attempts ≤ max_attempts` always;
//!    reclaims after crashes or lease expiry do not consume budget.
//! 3. **Terminal states are final** — `completed`, `failed`, `dead_letter`
//!    are never overwritten; late finalizes report "no change".
//! 4. **Registration is the trust boundary** — a task type with no
//!    registered handler dead-letters instead of executing.
//! 5. **At-least-once delivery** — a handler outliving its lease can run
//!    twice; handlers are idempotent or renew their lease.
//!
//! ## Example
//!
//! ```ignore
//! use prismq::{
//!     HandlerRegistry, NewTask, QueueStore, SchedulingStrategy, TaskQueue,
//!     WorkerEngine, WorkerEngineConfig,
//! };
//! use std::sync::Arc;
//!
//! let store = QueueStore::open("prismq_queue.db").await?;
//! let queue = TaskQueue::new(store.clone());
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register(
//!     "render",
//!     |task, _cancel| async move {
//!         let frames = task.payload()?["frames"].as_u64().unwrap_or(0);
//!         render_frames(frames).await
//!     },
//!     "renders frames from a payload",
//!     "1.0",
//!     false,
//! )?;
//!
//! queue
//!     .enqueue(NewTask::builder().task_type("render").build())
//!     .await?;
//!
//! let engine = WorkerEngine::new(
//!     store,
//!     registry,
//!     SchedulingStrategy::Priority,
//!     WorkerEngineConfig::with_worker_id("render-01"),
//! );
//! engine.run_until_shutdown().await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod maintenance;
pub mod queue;
pub mod registry;
pub mod scheduling;
pub mod store;
pub mod task;

pub use config::WorkerConfig;
pub use engine::{EngineHandle, WorkerEngine, WorkerEngineConfig};
pub use error::QueueError;
pub use executor::{BackoffPolicy, Executor, FinalizeOutcome};
pub use heartbeat::WorkerHeartbeat;
pub use maintenance::{
    BackupInfo, CheckpointMode, CheckpointResult, Maintenance, StoreStats,
};
pub use queue::{
    CancelOutcome, EnqueueResult, ListFilter, NewTask, QueueStats, TaskQueue,
};
pub use registry::{Handler, HandlerInfo, HandlerRegistry};
pub use scheduling::{SchedulingStrategy, TaskClaimer};
pub use store::{QueueStore, QueueStoreOptions};
pub use task::{capabilities_match, LogLevel, Task, TaskLog, TaskStatus, Worker};
