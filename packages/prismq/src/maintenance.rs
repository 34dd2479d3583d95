//! On-demand store maintenance: checkpointing, vacuum, integrity, stale-lease
//! sweeps, retention, and online backups.
//!
//! Nothing here runs autonomously. The queue exposes these as operations for
//! an operator (or the HTTP adapter) to invoke.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Row};
use tracing::info;

use crate::error::QueueError;
use crate::store::QueueStore;

/// WAL checkpoint modes, strongest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

/// Outcome of a WAL checkpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckpointResult {
    /// 1 when a checkpoint could not run to completion because of a reader.
    pub busy: i64,
    /// Total WAL frames.
    pub log_pages: i64,
    /// Frames moved into the main database.
    pub checkpointed_pages: i64,
}

/// Point-in-time size and mode statistics for the store file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub page_count: i64,
    pub page_size: i64,
    pub total_mb: f64,
    pub freelist_count: i64,
    pub wal_mode: String,
    pub wal_mb: f64,
}

/// A backup file on disk.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupInfo {
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

const TABLES: [&str; 3] = ["tasks", "workers", "task_logs"];

/// Maintenance operations over a store and its backups directory.
#[derive(Clone)]
pub struct Maintenance {
    store: QueueStore,
    backups_dir: PathBuf,
}

impl Maintenance {
    pub fn new(store: QueueStore, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            backups_dir: backups_dir.into(),
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Run a WAL checkpoint in the given mode.
    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult, QueueError> {
        let sql = format!("PRAGMA wal_checkpoint({})", mode.as_str());
        let row = sqlx::query(&sql).fetch_one(self.store.pool()).await?;
        Ok(CheckpointResult {
            busy: row.get(0),
            log_pages: row.get(1),
            checkpointed_pages: row.get(2),
        })
    }

    /// Rebuild the database file, reclaiming free pages.
    pub async fn vacuum(&self) -> Result<(), QueueError> {
        sqlx::query("VACUUM").execute(self.store.pool()).await?;
        Ok(())
    }

    /// Refresh the query planner's statistics, optionally for one table.
    pub async fn analyze(&self, table: Option<&str>) -> Result<(), QueueError> {
        let sql = match table {
            Some(name) => {
                if !TABLES.contains(&name) {
                    return Err(QueueError::Validation(format!(
                        "unknown table '{name}' (expected one of: {})",
                        TABLES.join(", ")
                    )));
                }
                format!("ANALYZE {name}")
            }
            None => "ANALYZE".to_string(),
        };
        sqlx::query(&sql).execute(self.store.pool()).await?;
        Ok(())
    }

    /// Full integrity check; `["ok"]` means the file is sound.
    pub async fn integrity_check(&self) -> Result<Vec<String>, QueueError> {
        let messages = sqlx::query_scalar::<_, String>("PRAGMA integrity_check")
            .fetch_all(self.store.pool())
            .await?;
        Ok(messages)
    }

    /// Lease-expiry safety net, independent of worker liveness: any lease
    /// that expired more than `timeout` ago goes back to `queued`. Attempts
    /// are preserved. Returns the number of reclaimed tasks.
    pub async fn cleanup_stale_leases(&self, timeout: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(timeout)
                .map_err(|_| QueueError::Validation("timeout out of range".into()))?;
        let reclaimed = sqlx::query(
            "UPDATE tasks SET \
                 status = 'queued', \
                 locked_by = NULL, \
                 reserved_at_utc = NULL, \
                 lease_until_utc = NULL, \
                 updated_at_utc = ?1 \
             WHERE status IN ('leased', 'processing') \
               AND lease_until_utc IS NOT NULL \
               AND lease_until_utc < ?2",
        )
        .bind(now)
        .bind(cutoff)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if reclaimed > 0 {
            info!(count = reclaimed, "reset stale leases");
        }
        Ok(reclaimed)
    }

    /// Retention: delete terminal tasks older than `max_age`. Task logs
    /// cascade with their rows.
    pub async fn cleanup_terminal_tasks(&self, max_age: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|_| QueueError::Validation("max age out of range".into()))?;
        let deleted = sqlx::query(
            "DELETE FROM tasks \
             WHERE status IN ('completed', 'failed', 'dead_letter') \
               AND finished_at_utc IS NOT NULL \
               AND finished_at_utc < ?1",
        )
        .bind(cutoff)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if deleted > 0 {
            info!(count = deleted, "deleted terminal tasks past retention");
        }
        Ok(deleted)
    }

    /// Current size/mode statistics.
    pub async fn stats(&self) -> Result<StoreStats, QueueError> {
        let pool = self.store.pool();
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count").fetch_one(pool).await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size").fetch_one(pool).await?;
        let freelist_count: i64 = sqlx::query_scalar("PRAGMA freelist_count")
            .fetch_one(pool)
            .await?;
        let wal_mode: String = sqlx::query_scalar("PRAGMA journal_mode").fetch_one(pool).await?;

        let wal_path = wal_sidecar(self.store.path());
        let wal_bytes = std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);

        Ok(StoreStats {
            page_count,
            page_size,
            total_mb: (page_count * page_size) as f64 / 1_048_576.0,
            freelist_count,
            wal_mode,
            wal_mb: wal_bytes as f64 / 1_048_576.0,
        })
    }

    /// Create an online backup via `VACUUM INTO`, named
    /// `queue_backup_<timestamp>[_name].db`.
    pub async fn create_backup(&self, name: Option<&str>) -> Result<BackupInfo, QueueError> {
        std::fs::create_dir_all(&self.backups_dir)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let file_name = match name {
            Some(suffix) => {
                let clean: String = suffix
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                    .collect();
                format!("queue_backup_{timestamp}_{clean}.db")
            }
            None => format!("queue_backup_{timestamp}.db"),
        };
        let path = self.backups_dir.join(&file_name);
        if path.exists() {
            return Err(QueueError::Validation(format!(
                "backup {file_name} already exists"
            )));
        }

        sqlx::query("VACUUM INTO ?1")
            .bind(path.to_string_lossy().into_owned())
            .execute(self.store.pool())
            .await?;

        let size_bytes = std::fs::metadata(&path)?.len();
        info!(backup = %path.display(), size_bytes, "created backup");
        Ok(BackupInfo {
            file_name,
            path,
            size_bytes,
        })
    }

    /// Open a backup read-only and run its integrity check.
    pub async fn verify_backup(&self, backup: &Path) -> Result<bool, QueueError> {
        if !backup.exists() {
            return Err(QueueError::Validation(format!(
                "backup {} does not exist",
                backup.display()
            )));
        }
        let mut conn = SqliteConnectOptions::new()
            .filename(backup)
            .read_only(true)
            .connect()
            .await?;
        let messages = sqlx::query_scalar::<_, String>("PRAGMA integrity_check")
            .fetch_all(&mut conn)
            .await?;
        let _ = conn.close().await;
        Ok(messages == ["ok"])
    }

    /// Backups on disk, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, QueueError> {
        let mut backups = Vec::new();
        if !self.backups_dir.exists() {
            return Ok(backups);
        }
        for entry in std::fs::read_dir(&self.backups_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !(file_name.starts_with("queue_backup_") && file_name.ends_with(".db")) {
                continue;
            }
            backups.push(BackupInfo {
                path: entry.path(),
                size_bytes: entry.metadata()?.len(),
                file_name,
            });
        }
        // Timestamped names sort chronologically.
        backups.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(backups)
    }

    /// Replace the database at `target` with a verified backup. The store
    /// using `target` must be closed first; stale WAL/SHM sidecars are
    /// removed so the restored file is read as-is.
    pub async fn restore_backup(backup: &Path, target: &Path) -> Result<(), QueueError> {
        if !backup.exists() {
            return Err(QueueError::Validation(format!(
                "backup {} does not exist",
                backup.display()
            )));
        }
        std::fs::copy(backup, target)?;
        for sidecar in [wal_sidecar(target), shm_sidecar(target)] {
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
            }
        }
        info!(backup = %backup.display(), target = %target.display(), "restored backup");
        Ok(())
    }

    /// Delete all but the newest `keep_count` backups. Returns how many were
    /// removed.
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<u64, QueueError> {
        let backups = self.list_backups()?;
        let mut removed = 0;
        for backup in backups.into_iter().skip(keep_count) {
            std::fs::remove_file(&backup.path)?;
            removed += 1;
        }
        if removed > 0 {
            info!(count = removed, keep_count, "pruned old backups");
        }
        Ok(removed)
    }

    /// Sweep a temp directory, deleting regular files whose modification
    /// time is older than `max_age`. Returns the number removed.
    pub fn cleanup_temp_files(dir: &Path, max_age: Duration) -> Result<u64, QueueError> {
        if !dir.exists() {
            return Ok(0);
        }
        let now = std::time::SystemTime::now();
        let mut removed = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.map_or(false, |age| age > max_age) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn wal_sidecar(db: &Path) -> PathBuf {
    let mut os = db.as_os_str().to_owned();
    os.push("-wal");
    PathBuf::from(os)
}

fn shm_sidecar(db: &Path) -> PathBuf {
    let mut os = db.as_os_str().to_owned();
    os.push("-shm");
    PathBuf::from(os)
}
