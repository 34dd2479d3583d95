//! SQLite-backed queue store.
//!
//! A single database file is the only point of coordination between workers.
//! WAL journaling lets readers proceed alongside the single writer; the
//! busy-timeout absorbs short writer contention before an operation surfaces
//! [`QueueError::Busy`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::QueueError;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Tuning knobs for opening a store.
#[derive(Debug, Clone)]
pub struct QueueStoreOptions {
    /// Pool size. Should cover max concurrent engines plus API headroom.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing busy.
    pub busy_timeout: Duration,
}

impl Default for QueueStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to the queue database. Cheap to clone; all components share one.
#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl QueueStore {
    /// Open (creating if missing) and migrate the queue database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        Self::open_with(path, QueueStoreOptions::default()).await
    }

    /// Open with explicit pool/timeout options.
    pub async fn open_with(
        path: impl AsRef<Path>,
        options: QueueStoreOptions,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let connect = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect)
            .await?;

        MIGRATOR.run(&pool).await.map_err(|e| match e {
            sqlx::migrate::MigrateError::Execute(e) => QueueError::from(e),
            other => QueueError::Validation(format!("migration failed: {other}")),
        })?;

        info!(path = %path.display(), "queue store opened");
        Ok(Self { pool, path })
    }

    /// The pooled connection handle.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Filesystem location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a write transaction. Everything executed in the returned scope
    /// commits atomically or rolls back entirely.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, QueueError> {
        Ok(self.pool.begin().await?)
    }

    /// Close the pool, flushing outstanding work. Required before restoring
    /// a backup over the live file.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("path", &self.path)
            .field("pool_size", &self.pool.size())
            .finish()
    }
}
