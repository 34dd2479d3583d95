//! On-demand maintenance endpoints.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::server::app::{ApiError, AppState};

const HOUR: u64 = 3600;

/// Thresholds for the health check, tuned for a single-host queue.
const MAX_QUEUE_DEPTH: i64 = 10_000;
const MAX_DEAD_LETTER_BACKLOG: i64 = 1_000;
const MAX_STORE_MB: f64 = 1024.0;

#[derive(Debug, Deserialize)]
pub struct MaxAgeQuery {
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: u64,
    pub max_age_hours: u64,
}

/// POST /system/maintenance/cleanup-runs?max_age_hours= — delete terminal
/// tasks past the retention window (default 24h).
pub async fn cleanup_runs_handler(
    State(state): State<AppState>,
    Query(query): Query<MaxAgeQuery>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let max_age_hours = query.max_age_hours.unwrap_or(24);
    let removed = state
        .maintenance
        .cleanup_terminal_tasks(Duration::from_secs(max_age_hours * HOUR))
        .await?;
    Ok(Json(CleanupResponse {
        removed,
        max_age_hours,
    }))
}

/// POST /system/maintenance/cleanup-temp-files?max_age_hours=
pub async fn cleanup_temp_files_handler(
    State(state): State<AppState>,
    Query(query): Query<MaxAgeQuery>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let max_age_hours = query.max_age_hours.unwrap_or(24);
    let removed = prismq::Maintenance::cleanup_temp_files(
        &state.temp_dir,
        Duration::from_secs(max_age_hours * HOUR),
    )?;
    Ok(Json(CleanupResponse {
        removed,
        max_age_hours,
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthCheck {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub checks: serde_json::Map<String, serde_json::Value>,
}

fn check(ok: bool, detail: String) -> HealthCheck {
    HealthCheck {
        status: if ok { "ok".into() } else { "warn".into() },
        detail: Some(detail),
    }
}

/// POST /system/maintenance/health-check — database reachability plus
/// store-size, queue-depth, and dead-letter thresholds.
pub async fn health_check_handler(
    State(state): State<AppState>,
) -> Result<Json<HealthCheckResponse>, ApiError> {
    let mut checks = serde_json::Map::new();

    let db_check = match tokio::time::timeout(
        Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(state.queue.store().pool()),
    )
    .await
    {
        Ok(Ok(_)) => HealthCheck {
            status: "ok".into(),
            detail: None,
        },
        Ok(Err(e)) => HealthCheck {
            status: "error".into(),
            detail: Some(format!("query failed: {e}")),
        },
        Err(_) => HealthCheck {
            status: "error".into(),
            detail: Some("query timeout (>5s)".into()),
        },
    };
    let db_ok = db_check.status == "ok";
    checks.insert("database".into(), json!(db_check));

    if db_ok {
        let stats = state.queue.stats().await?;
        let store = state.maintenance.stats().await?;

        let depth = stats.by_status.get("queued").copied().unwrap_or(0);
        checks.insert(
            "queue_depth".into(),
            json!(check(
                depth <= MAX_QUEUE_DEPTH,
                format!("{depth} queued (threshold {MAX_QUEUE_DEPTH})")
            )),
        );
        let dead = stats.by_status.get("dead_letter").copied().unwrap_or(0);
        checks.insert(
            "dead_letter_backlog".into(),
            json!(check(
                dead <= MAX_DEAD_LETTER_BACKLOG,
                format!("{dead} dead-lettered (threshold {MAX_DEAD_LETTER_BACKLOG})")
            )),
        );
        checks.insert(
            "store_size".into(),
            json!(check(
                store.total_mb <= MAX_STORE_MB,
                format!("{:.1} MB (threshold {MAX_STORE_MB} MB)", store.total_mb)
            )),
        );
    }

    let any_warn = checks
        .values()
        .any(|c| c["status"] == "warn");
    let status = if !db_ok {
        "unhealthy"
    } else if any_warn {
        "degraded"
    } else {
        "healthy"
    };

    Ok(Json(HealthCheckResponse {
        status: status.into(),
        checks,
    }))
}

/// POST /system/maintenance/log-statistics — log and return point-in-time
/// store and queue statistics.
pub async fn log_statistics_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queue_stats = state.queue.stats().await?;
    let store_stats = state.maintenance.stats().await?;

    info!(
        total_tasks = queue_stats.total,
        queued = queue_stats.by_status.get("queued").copied().unwrap_or(0),
        dead_letter = queue_stats
            .by_status
            .get("dead_letter")
            .copied()
            .unwrap_or(0),
        store_mb = store_stats.total_mb,
        wal_mb = store_stats.wal_mb,
        "queue statistics"
    );

    Ok(Json(json!({
        "queue": queue_stats,
        "store": store_stats,
    })))
}
