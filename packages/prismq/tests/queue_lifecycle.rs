//! End-to-end lifecycle tests over a scratch store: enqueue, claim,
//! finalize, retry, dead-letter, cancel, idempotency, and stale-lease
//! recovery.

use std::time::Duration;

use chrono::Utc;
use prismq::executor::BackoffPolicy;
use prismq::{
    scheduling, CancelOutcome, Executor, FinalizeOutcome, Maintenance, NewTask, QueueError,
    QueueStore, SchedulingStrategy, TaskQueue, TaskStatus, WorkerHeartbeat,
};
use serde_json::json;
use tempfile::TempDir;

async fn open_store() -> (TempDir, QueueStore) {
    let dir = TempDir::new().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).await.unwrap();
    (dir, store)
}

fn caps(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap_or_default()
}

const LEASE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn enqueue_claim_complete_round_trip() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let executor = Executor::new(store.clone());
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    let result = queue
        .enqueue(
            NewTask::builder()
                .task_type("render")
                .payload(json!({"frames": 24}))
                .build(),
        )
        .await
        .unwrap();
    assert!(result.is_created());
    let task_id = result.task_id();

    let claimed = claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .expect("task should be claimable");
    assert_eq!(claimed.id, task_id);
    assert_eq!(claimed.status, TaskStatus::Leased);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.locked_by.as_deref(), Some("worker-a"));
    let reserved = claimed.reserved_at_utc.unwrap();
    assert!(claimed.lease_until_utc.unwrap() > reserved);

    assert_eq!(
        executor.complete(task_id).await.unwrap(),
        FinalizeOutcome::Completed
    );

    let task = queue.status(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 1);
    assert!(task.locked_by.is_none());
    assert!(task.finished_at_utc.is_some());

    // Nothing left to claim.
    assert!(claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn retry_then_dead_letter() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let executor = Executor::new(store.clone());
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    let task_id = queue
        .enqueue(
            NewTask::builder()
                .task_type("flaky")
                .max_attempts(2)
                .build(),
        )
        .await
        .unwrap()
        .task_id();

    // First attempt fails: requeued with ~1s backoff.
    claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();
    let before = Utc::now();
    let outcome = executor.fail(task_id, "boom", true).await.unwrap();
    let run_after = match outcome {
        FinalizeOutcome::Retried { run_after_utc } => run_after_utc,
        other => panic!("expected retry, got {other:?}"),
    };
    let delay = (run_after - before).num_milliseconds();
    assert!((700..=1400).contains(&delay), "backoff {delay}ms not ~1s");

    let task = queue.status(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.error_message.as_deref(), Some("boom"));

    // Not claimable until run_after passes.
    assert!(claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .is_none());

    // Pull run_after back and fail again: budget exhausted, dead-letter.
    sqlx::query("UPDATE tasks SET run_after_utc = ?1 WHERE id = ?2")
        .bind(Utc::now() - chrono::Duration::seconds(1))
        .bind(task_id)
        .execute(store.pool())
        .await
        .unwrap();

    let claimed = claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts, 2);

    assert_eq!(
        executor.fail(task_id, "boom again", true).await.unwrap(),
        FinalizeOutcome::DeadLettered
    );
    let task = queue.status(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::DeadLetter);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.error_message.as_deref(), Some("boom again"));
    assert!(task.finished_at_utc.is_some());
}

#[tokio::test]
async fn max_attempts_one_dead_letters_on_first_failure() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let executor = Executor::new(store.clone());
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    let task_id = queue
        .enqueue(
            NewTask::builder()
                .task_type("one-shot")
                .max_attempts(1)
                .build(),
        )
        .await
        .unwrap()
        .task_id();

    claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        executor.fail(task_id, "fatal", true).await.unwrap(),
        FinalizeOutcome::DeadLettered
    );
    assert_eq!(
        queue.status(task_id).await.unwrap().status,
        TaskStatus::DeadLetter
    );
}

#[tokio::test]
async fn zero_backoff_executor_retries_immediately() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let executor = Executor::with_backoff(
        store.clone(),
        BackoffPolicy {
            initial: Duration::ZERO,
            jitter: 0.0,
            ..BackoffPolicy::default()
        },
    );
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    let task_id = queue
        .enqueue(NewTask::builder().task_type("flaky").build())
        .await
        .unwrap()
        .task_id();

    for attempt in 1..=2 {
        let claimed = claimer
            .claim("worker-a", &caps(json!({})), LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, attempt);
        executor.fail(task_id, "transient", true).await.unwrap();
    }

    // Third claim uses the final attempt; retry budget then runs out.
    let claimed = claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts, 3);
    assert_eq!(
        executor.fail(task_id, "transient", true).await.unwrap(),
        FinalizeOutcome::DeadLettered
    );
}

#[tokio::test]
async fn idempotent_enqueue_returns_existing_task() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());

    let first = queue
        .enqueue(
            NewTask::builder()
                .task_type("report")
                .idempotency_key("k1")
                .build(),
        )
        .await
        .unwrap();
    let second = queue
        .enqueue(
            NewTask::builder()
                .task_type("report")
                .idempotency_key("k1")
                .build(),
        )
        .await
        .unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.task_id(), second.task_id());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn future_run_after_is_not_claimable_until_due() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    let task_id = queue
        .enqueue(
            NewTask::builder()
                .task_type("later")
                .run_after_utc(Utc::now() + chrono::Duration::hours(1))
                .build(),
        )
        .await
        .unwrap()
        .task_id();

    assert!(claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .is_none());

    sqlx::query("UPDATE tasks SET run_after_utc = ?1 WHERE id = ?2")
        .bind(Utc::now() - chrono::Duration::seconds(1))
        .bind(task_id)
        .execute(store.pool())
        .await
        .unwrap();

    assert!(claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn cancel_on_each_status() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let executor = Executor::new(store.clone());
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    // Queued: cancels.
    let queued_id = queue
        .enqueue(NewTask::builder().task_type("a").build())
        .await
        .unwrap()
        .task_id();
    assert_eq!(
        queue.cancel(queued_id).await.unwrap(),
        CancelOutcome::Cancelled
    );
    let task = queue.status(queued_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("Cancelled by user"));

    // Leased: cancels; the worker's late completion is a no-op.
    let leased_id = queue
        .enqueue(NewTask::builder().task_type("b").build())
        .await
        .unwrap()
        .task_id();
    claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        queue.cancel(leased_id).await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        executor.complete(leased_id).await.unwrap(),
        FinalizeOutcome::NoChange
    );
    assert_eq!(
        queue.status(leased_id).await.unwrap().status,
        TaskStatus::Failed
    );

    // Terminal: reported, not mutated.
    assert_eq!(
        queue.cancel(leased_id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(TaskStatus::Failed)
    );

    // Unknown id.
    assert!(matches!(
        queue.cancel(999_999).await,
        Err(QueueError::NotFound { .. })
    ));
}

#[tokio::test]
async fn stale_lease_cleanup_requeues_with_cleared_lock() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let maintenance = Maintenance::new(store.clone(), "unused-backups");

    let task_id = queue
        .enqueue(NewTask::builder().task_type("orphaned").build())
        .await
        .unwrap()
        .task_id();

    // Simulate a worker that died mid-lease ten minutes ago.
    sqlx::query(
        "UPDATE tasks SET status = 'leased', locked_by = 'ghost', \
         reserved_at_utc = ?1, lease_until_utc = ?1 WHERE id = ?2",
    )
    .bind(Utc::now() - chrono::Duration::minutes(10))
    .bind(task_id)
    .execute(store.pool())
    .await
    .unwrap();

    let reclaimed = maintenance
        .cleanup_stale_leases(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let task = queue.status(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.locked_by.is_none());
    assert!(task.lease_until_utc.is_none());
}

#[tokio::test]
async fn fresh_leases_survive_the_stale_sweep() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let maintenance = Maintenance::new(store.clone(), "unused-backups");
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    queue
        .enqueue(NewTask::builder().task_type("busy").build())
        .await
        .unwrap();
    claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        maintenance
            .cleanup_stale_leases(Duration::from_secs(300))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn heartbeat_reclaim_preserves_attempts() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let heartbeat = WorkerHeartbeat::with_threshold(store.clone(), Duration::from_secs(300));
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    let task_id = queue
        .enqueue(NewTask::builder().task_type("render").build())
        .await
        .unwrap()
        .task_id();
    claimer
        .claim("doomed-worker", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();

    // The worker beat once, then went silent for ten minutes.
    sqlx::query(
        "INSERT INTO workers (worker_id, capabilities, heartbeat_utc) VALUES (?1, '{}', ?2)",
    )
    .bind("doomed-worker")
    .bind(Utc::now() - chrono::Duration::minutes(10))
    .execute(store.pool())
    .await
    .unwrap();

    assert_eq!(heartbeat.reclaim_stale_tasks().await.unwrap(), 1);

    let task = queue.status(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.locked_by.is_none());
    // The retry budget is what it was after the original claim.
    assert_eq!(task.attempts, 1);
}

#[tokio::test]
async fn stale_worker_partition_and_cleanup() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let heartbeat = WorkerHeartbeat::with_threshold(store.clone(), Duration::from_secs(300));
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    heartbeat
        .beat("alive", &caps(json!({"gpu": true})))
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO workers (worker_id, capabilities, heartbeat_utc) VALUES (?1, '{}', ?2)",
    )
    .bind("silent-idle")
    .bind(Utc::now() - chrono::Duration::minutes(20))
    .execute(store.pool())
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO workers (worker_id, capabilities, heartbeat_utc) VALUES (?1, '{}', ?2)",
    )
    .bind("silent-holding")
    .bind(Utc::now() - chrono::Duration::minutes(20))
    .execute(store.pool())
    .await
    .unwrap();

    queue
        .enqueue(NewTask::builder().task_type("held").build())
        .await
        .unwrap();
    let claimed = claimer
        .claim("silent-holding", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.locked_by.as_deref(), Some("silent-holding"));

    let active: Vec<String> = heartbeat
        .active()
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.worker_id)
        .collect();
    assert_eq!(active, vec!["alive"]);
    assert_eq!(heartbeat.stale().await.unwrap().len(), 2);

    // Non-forced cleanup keeps the lease holder.
    assert_eq!(heartbeat.cleanup_stale_workers(false).await.unwrap(), 1);
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workers")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 2);

    assert_eq!(heartbeat.cleanup_stale_workers(true).await.unwrap(), 1);
}

#[tokio::test]
async fn beat_upserts_capabilities() {
    let (_dir, store) = open_store().await;
    let heartbeat = WorkerHeartbeat::new(store.clone());

    heartbeat
        .beat("w1", &caps(json!({"gpu": false})))
        .await
        .unwrap();
    heartbeat
        .beat("w1", &caps(json!({"gpu": true})))
        .await
        .unwrap();

    let workers = heartbeat.active().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(
        workers[0].capabilities().unwrap()["gpu"],
        serde_json::json!(true)
    );
}

#[tokio::test]
async fn stats_and_list_report_queue_shape() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let executor = Executor::new(store.clone());
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    for _ in 0..3 {
        queue
            .enqueue(NewTask::builder().task_type("render").build())
            .await
            .unwrap();
    }
    queue
        .enqueue(NewTask::builder().task_type("report").build())
        .await
        .unwrap();

    let claimed = claimer
        .claim("worker-a", &caps(json!({})), LEASE)
        .await
        .unwrap()
        .unwrap();
    executor.complete(claimed.id).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_status["queued"], 3);
    assert_eq!(stats.by_status["completed"], 1);
    assert_eq!(stats.by_status["dead_letter"], 0);
    assert!(stats.oldest_queued_age_seconds.is_some());

    // Newest first.
    let all = queue.list(prismq::ListFilter::default()).await.unwrap();
    assert_eq!(all.len(), 4);
    assert!(all.windows(2).all(|pair| pair[0].id > pair[1].id));

    let renders = queue
        .list(prismq::ListFilter {
            task_type: Some("render".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(renders.len(), 3);

    let completed = queue
        .list(prismq::ListFilter {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);

    let limited = queue
        .list(prismq::ListFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn task_logs_append_and_cascade_on_delete() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());

    let task_id = queue
        .enqueue(NewTask::builder().task_type("render").build())
        .await
        .unwrap()
        .task_id();

    queue
        .append_log(task_id, prismq::LogLevel::Info, "started", None)
        .await
        .unwrap();
    queue
        .append_log(
            task_id,
            prismq::LogLevel::Warning,
            "slow frame",
            Some(&json!({"frame": 12})),
        )
        .await
        .unwrap();

    let logs = queue.logs(task_id).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "started");
    assert_eq!(logs[1].level, prismq::LogLevel::Warning);
    assert!(logs[1].details.as_deref().unwrap().contains("12"));

    assert!(queue.delete(task_id).await.unwrap());
    let orphaned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_logs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(orphaned, 0);
}

#[tokio::test]
async fn renew_lease_extends_only_active_holds() {
    let (_dir, store) = open_store().await;
    let queue = TaskQueue::new(store.clone());
    let executor = Executor::new(store.clone());
    let claimer = scheduling::for_strategy(SchedulingStrategy::Fifo, store.clone());

    let task_id = queue
        .enqueue(NewTask::builder().task_type("long").build())
        .await
        .unwrap()
        .task_id();
    let claimed = claimer
        .claim("worker-a", &caps(json!({})), Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    let original_lease = claimed.lease_until_utc.unwrap();

    assert!(executor
        .renew_lease(task_id, Duration::from_secs(120))
        .await
        .unwrap());
    let task = queue.status(task_id).await.unwrap();
    assert!(task.lease_until_utc.unwrap() > original_lease);

    executor.complete(task_id).await.unwrap();
    assert!(!executor
        .renew_lease(task_id, Duration::from_secs(120))
        .await
        .unwrap());
}
