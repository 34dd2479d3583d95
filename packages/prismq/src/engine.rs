//! Worker engine: the claim → validate → dispatch → finalize poll loop.
//!
//! Engines share nothing in memory; every coordination point is a store
//! write. One engine processes tasks strictly sequentially. Run several
//! engines (or several processes) for parallelism — the claimers guarantee
//! each task lands on exactly one of them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::executor::{Executor, FinalizeOutcome};
use crate::heartbeat::WorkerHeartbeat;
use crate::registry::HandlerRegistry;
use crate::scheduling::{self, SchedulingStrategy, TaskClaimer};
use crate::store::QueueStore;
use crate::task::{LogLevel, Task, TaskLog};

/// Engine settings, usually derived from a [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct WorkerEngineConfig {
    pub worker_id: String,
    pub capabilities: Map<String, Value>,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
}

impl Default for WorkerEngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            capabilities: Map::new(),
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerEngineConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

impl From<&WorkerConfig> for WorkerEngineConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            capabilities: config.capabilities.clone(),
            lease_duration: config.lease_duration(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Handle for stopping a running engine from outside.
#[derive(Clone)]
pub struct EngineHandle {
    shutdown: CancellationToken,
    force: CancellationToken,
}

impl EngineHandle {
    /// Cooperative stop: the loop exits after the in-flight task (if any)
    /// finishes and its outcome is written.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop and additionally ask the current handler to cancel. Handlers
    /// observe this through the token they were dispatched with.
    pub fn stop_force(&self) {
        self.force.cancel();
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A single polling worker over the queue.
pub struct WorkerEngine {
    store: QueueStore,
    registry: Arc<HandlerRegistry>,
    claimer: Box<dyn TaskClaimer>,
    executor: Executor,
    heartbeat: WorkerHeartbeat,
    config: WorkerEngineConfig,
    shutdown: CancellationToken,
    force: CancellationToken,
}

impl WorkerEngine {
    pub fn new(
        store: QueueStore,
        registry: Arc<HandlerRegistry>,
        strategy: SchedulingStrategy,
        config: WorkerEngineConfig,
    ) -> Self {
        let claimer = scheduling::for_strategy(strategy, store.clone());
        let executor = Executor::new(store.clone());
        let heartbeat = WorkerHeartbeat::new(store.clone());
        Self {
            store,
            registry,
            claimer,
            executor,
            heartbeat,
            config,
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    /// Build an engine straight from a loaded worker configuration.
    pub fn from_worker_config(
        store: QueueStore,
        registry: Arc<HandlerRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        Self::new(
            store,
            registry,
            config.scheduling_strategy,
            WorkerEngineConfig::from(config),
        )
    }

    /// Obtain a stop handle before consuming the engine with [`run`].
    ///
    /// [`run`]: WorkerEngine::run
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shutdown: self.shutdown.clone(),
            force: self.force.clone(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until stopped. Loop-level errors are logged and survived; only a
    /// stop request ends the loop.
    pub async fn run(self) -> Result<(), QueueError> {
        info!(
            worker_id = %self.config.worker_id,
            strategy = %self.claimer.strategy(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker engine starting"
        );

        let mut last_beat: Option<Instant> = None;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Heartbeat on the poll cadence.
            if last_beat.map_or(true, |at| at.elapsed() >= self.config.poll_interval) {
                if let Err(e) = self
                    .heartbeat
                    .beat(&self.config.worker_id, &self.config.capabilities)
                    .await
                {
                    error!(worker_id = %self.config.worker_id, error = %e, "heartbeat failed");
                }
                last_beat = Some(Instant::now());
            }

            let claimed = match self
                .claimer
                .claim(
                    &self.config.worker_id,
                    &self.config.capabilities,
                    self.config.lease_duration,
                )
                .await
            {
                Ok(task) => task,
                Err(e) if e.is_retriable() => {
                    warn!(worker_id = %self.config.worker_id, error = %e, "claim hit busy store, backing off");
                    self.sleep_interruptible(Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "claim failed");
                    self.sleep_interruptible(self.config.poll_interval).await;
                    continue;
                }
            };

            let Some(task) = claimed else {
                self.sleep_interruptible(self.config.poll_interval).await;
                continue;
            };

            self.process(task).await;
        }

        info!(worker_id = %self.config.worker_id, "worker engine stopped");
        Ok(())
    }

    /// Run until stopped or ctrl-c.
    pub async fn run_until_shutdown(self) -> Result<(), QueueError> {
        let handle = self.handle();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            handle.stop();
        });
        self.run().await
    }

    async fn sleep_interruptible(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Execute one claimed task end to end. Never propagates: every failure
    /// ends up in task state or in the log.
    async fn process(&self, task: Task) {
        let task_id = task.id;
        let task_type = task.task_type.clone();
        debug!(task_id, task_type = %task_type, "claimed task");

        // Unregistered types dead-letter immediately; executing them would
        // mean trusting whatever was written into the store.
        let handler = match self.registry.get(&task_type) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(task_id, task_type = %task_type, error = %e, "no handler for claimed task");
                self.finalize_failure(task_id, &e.to_string(), false).await;
                return;
            }
        };

        match self.executor.mark_processing(task_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Lease was taken away between claim and dispatch.
                debug!(task_id, "lost lease before dispatch");
                return;
            }
            Err(e) => {
                error!(task_id, error = %e, "failed to mark task processing");
                return;
            }
        }

        self.log_task(
            task_id,
            LogLevel::Info,
            &format!("dispatching on worker {}", self.config.worker_id),
        )
        .await;

        // Dispatch on a separate tokio task so a panicking handler surfaces
        // as a JoinError instead of tearing down the engine.
        let cancel = self.force.child_token();
        let invocation = tokio::spawn(handler(task, cancel));
        let result = match invocation.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(join_err) if join_err.is_panic() => Err("handler panicked".to_string()),
            Err(_) => Err("handler aborted".to_string()),
        };

        match result {
            Ok(()) => {
                match self.executor.complete(task_id).await {
                    Ok(FinalizeOutcome::Completed) => {
                        info!(task_id, task_type = %task_type, "task completed");
                        self.log_task(task_id, LogLevel::Info, "completed").await;
                    }
                    Ok(FinalizeOutcome::NoChange) => {
                        // Cancelled or reclaimed while running; the recorded
                        // state wins over our late success.
                        debug!(task_id, "completion superseded by terminal state");
                    }
                    Ok(_) => {}
                    Err(e) => error!(task_id, error = %e, "failed to record completion"),
                }
            }
            Err(message) => {
                warn!(task_id, task_type = %task_type, error = %message, "task failed");
                self.finalize_failure(task_id, &message, true).await;
            }
        }
    }

    async fn finalize_failure(&self, task_id: i64, message: &str, retry: bool) {
        match self.executor.fail(task_id, message, retry).await {
            Ok(FinalizeOutcome::Retried { run_after_utc }) => {
                self.log_task(
                    task_id,
                    LogLevel::Warning,
                    &format!("retry scheduled for {run_after_utc}"),
                )
                .await;
            }
            Ok(FinalizeOutcome::DeadLettered) => {
                error!(task_id, error = %message, "task dead-lettered");
                self.log_task(task_id, LogLevel::Error, &format!("dead-lettered: {message}"))
                    .await;
            }
            Ok(FinalizeOutcome::NoChange) => {
                debug!(task_id, "failure superseded by terminal state");
            }
            Ok(FinalizeOutcome::Completed) => {}
            Err(e) => error!(task_id, error = %e, "failed to record task failure"),
        }
    }

    async fn log_task(&self, task_id: i64, level: LogLevel, message: &str) {
        if let Err(e) = TaskLog::append(self.store.pool(), task_id, level, message, None).await {
            // A missing row (e.g. admin delete mid-flight) only costs the log line.
            debug!(task_id, error = %e, "task log append failed");
        }
    }
}
