use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    pub backups_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            db_path: env::var("PRISMQ_QUEUE_DB_PATH")
                .unwrap_or_else(|_| "prismq_queue.db".to_string())
                .into(),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            backups_dir: env::var("PRISMQ_BACKUPS_DIR")
                .unwrap_or_else(|_| "backups".to_string())
                .into(),
            temp_dir: env::var("PRISMQ_TEMP_DIR")
                .unwrap_or_else(|_| env::temp_dir().join("prismq").to_string_lossy().into_owned())
                .into(),
        })
    }
}
