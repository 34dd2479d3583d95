pub mod health;
pub mod maintenance;
pub mod queue;

pub use health::health_handler;
pub use maintenance::{
    cleanup_runs_handler, cleanup_temp_files_handler, health_check_handler,
    log_statistics_handler,
};
pub use queue::{
    cancel_task_handler, enqueue_handler, get_task_handler, list_tasks_handler,
    list_workers_handler, queue_stats_handler,
};
