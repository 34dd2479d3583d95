//! Worker configuration: file-based (JSON/YAML/TOML by extension) with
//! environment overrides.
//!
//! Environment always wins over file values, so a deployment can ship one
//! config file and differentiate workers with `PRISMQ_WORKER_*` variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueueError;
use crate::scheduling::SchedulingStrategy;

pub const ENV_WORKER_ID: &str = "PRISMQ_WORKER_ID";
pub const ENV_SCHEDULING_STRATEGY: &str = "PRISMQ_WORKER_SCHEDULING_STRATEGY";
pub const ENV_LEASE_DURATION_SECONDS: &str = "PRISMQ_WORKER_LEASE_DURATION_SECONDS";
pub const ENV_POLL_INTERVAL_SECONDS: &str = "PRISMQ_WORKER_POLL_INTERVAL_SECONDS";
pub const ENV_MAX_RETRIES: &str = "PRISMQ_WORKER_MAX_RETRIES";
pub const ENV_CAPABILITIES: &str = "PRISMQ_WORKER_CAPABILITIES";

fn default_lease_duration_seconds() -> u64 {
    60
}

fn default_poll_interval_seconds() -> u64 {
    1
}

fn default_max_retries() -> u32 {
    3
}

/// Per-worker settings.
///
/// Field order keeps scalar values ahead of the capabilities table so the
/// TOML serializer accepts the struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub scheduling_strategy: SchedulingStrategy,
    #[serde(default = "default_lease_duration_seconds")]
    pub lease_duration_seconds: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub capabilities: Map<String, Value>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            scheduling_strategy: SchedulingStrategy::default(),
            lease_duration_seconds: default_lease_duration_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
            max_retries: default_max_retries(),
            capabilities: Map::new(),
        }
    }
}

impl WorkerConfig {
    /// Load from a config file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let mut config = Self::load_without_env(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a config file only (format detected by extension).
    pub fn load_without_env(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = match extension(path) {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| QueueError::Validation(format!("invalid JSON config: {e}")))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| QueueError::Validation(format!("invalid YAML config: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| QueueError::Validation(format!("invalid TOML config: {e}")))?,
            other => {
                return Err(QueueError::Validation(format!(
                    "unsupported config format '.{other}' (expected .json, .yaml, .yml, or .toml)"
                )))
            }
        };
        Ok(config)
    }

    /// Build purely from `PRISMQ_WORKER_*` environment variables.
    pub fn from_env() -> Result<Self, QueueError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay any set `PRISMQ_WORKER_*` variables onto this config.
    pub fn apply_env_overrides(&mut self) -> Result<(), QueueError> {
        if let Ok(worker_id) = std::env::var(ENV_WORKER_ID) {
            self.worker_id = worker_id;
        }
        if let Ok(strategy) = std::env::var(ENV_SCHEDULING_STRATEGY) {
            self.scheduling_strategy = strategy.parse()?;
        }
        if let Ok(raw) = std::env::var(ENV_LEASE_DURATION_SECONDS) {
            self.lease_duration_seconds = parse_env_number(ENV_LEASE_DURATION_SECONDS, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_POLL_INTERVAL_SECONDS) {
            self.poll_interval_seconds = parse_env_number(ENV_POLL_INTERVAL_SECONDS, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_MAX_RETRIES) {
            self.max_retries = parse_env_number(ENV_MAX_RETRIES, &raw)? as u32;
        }
        if let Ok(raw) = std::env::var(ENV_CAPABILITIES) {
            let value: Value = serde_json::from_str(&raw).map_err(|e| {
                QueueError::Validation(format!("{ENV_CAPABILITIES} is not valid JSON: {e}"))
            })?;
            self.capabilities = value.as_object().cloned().ok_or_else(|| {
                QueueError::Validation(format!("{ENV_CAPABILITIES} must be a JSON object"))
            })?;
        }
        Ok(())
    }

    /// Reject configs that cannot drive a worker.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker_id.trim().is_empty() {
            return Err(QueueError::Validation(format!(
                "worker_id is required (set it in the config file or {ENV_WORKER_ID})"
            )));
        }
        if self.lease_duration_seconds == 0 {
            return Err(QueueError::Validation(
                "lease_duration_seconds must be >= 1".into(),
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err(QueueError::Validation(
                "poll_interval_seconds must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Write this config, format chosen by the target extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), QueueError> {
        let path = path.as_ref();
        let serialized = match extension(path) {
            "json" => serde_json::to_string_pretty(self)
                .map_err(|e| QueueError::Validation(format!("serialize JSON: {e}")))?,
            "yaml" | "yml" => serde_yaml::to_string(self)
                .map_err(|e| QueueError::Validation(format!("serialize YAML: {e}")))?,
            "toml" => toml::to_string_pretty(self)
                .map_err(|e| QueueError::Validation(format!("serialize TOML: {e}")))?,
            other => {
                return Err(QueueError::Validation(format!(
                    "unsupported config format '.{other}'"
                )))
            }
        };
        std::fs::write(path, serialized)?;
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or("")
}

fn parse_env_number(var: &str, raw: &str) -> Result<u64, QueueError> {
    raw.parse::<u64>()
        .map_err(|_| QueueError::Validation(format!("{var} must be a non-negative integer, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env mutations are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            ENV_WORKER_ID,
            ENV_SCHEDULING_STRATEGY,
            ENV_LEASE_DURATION_SECONDS,
            ENV_POLL_INTERVAL_SECONDS,
            ENV_MAX_RETRIES,
            ENV_CAPABILITIES,
        ] {
            std::env::remove_var(var);
        }
    }

    fn sample_config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "render-01".into(),
            scheduling_strategy: SchedulingStrategy::Priority,
            lease_duration_seconds: 120,
            poll_interval_seconds: 2,
            max_retries: 5,
            capabilities: serde_json::json!({"gpu": true, "region": "us-west"})
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: WorkerConfig = serde_json::from_str(r#"{"worker_id": "w1"}"#).unwrap();
        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.scheduling_strategy, SchedulingStrategy::Fifo);
        assert_eq!(config.lease_duration_seconds, 60);
        assert_eq!(config.poll_interval_seconds, 1);
        assert_eq!(config.max_retries, 3);
        assert!(config.capabilities.is_empty());
    }

    #[test]
    fn save_load_round_trip_all_formats() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();

        for file_name in ["worker.json", "worker.yaml", "worker.toml"] {
            let path = dir.path().join(file_name);
            config.save(&path).unwrap();
            let loaded = WorkerConfig::load(&path).unwrap();
            assert_eq!(loaded, config, "round trip failed for {file_name}");
        }
    }

    #[test]
    fn unsupported_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.ini");
        std::fs::write(&path, "worker_id=w1").unwrap();
        assert!(matches!(
            WorkerConfig::load_without_env(&path),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn env_overrides_file_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        sample_config().save(&path).unwrap();

        std::env::set_var(ENV_WORKER_ID, "env-worker");
        std::env::set_var(ENV_SCHEDULING_STRATEGY, "weighted_random");
        std::env::set_var(ENV_LEASE_DURATION_SECONDS, "30");
        std::env::set_var(ENV_CAPABILITIES, r#"{"gpu": false}"#);

        let loaded = WorkerConfig::load(&path).unwrap();
        clear_env();

        assert_eq!(loaded.worker_id, "env-worker");
        assert_eq!(loaded.scheduling_strategy, SchedulingStrategy::WeightedRandom);
        assert_eq!(loaded.lease_duration_seconds, 30);
        assert_eq!(loaded.capabilities["gpu"], serde_json::json!(false));
        // Untouched fields keep the file values.
        assert_eq!(loaded.poll_interval_seconds, 2);
        assert_eq!(loaded.max_retries, 5);
    }

    #[test]
    fn missing_worker_id_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{"scheduling_strategy": "fifo"}"#).unwrap();

        assert!(matches!(
            WorkerConfig::load(&path),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn invalid_strategy_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{"worker_id": "w1", "scheduling_strategy": "round_robin"}"#,
        )
        .unwrap();

        assert!(matches!(
            WorkerConfig::load(&path),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn from_env_requires_worker_id() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        assert!(WorkerConfig::from_env().is_err());

        std::env::set_var(ENV_WORKER_ID, "env-only");
        let config = WorkerConfig::from_env().unwrap();
        clear_env();
        assert_eq!(config.worker_id, "env-only");
        assert_eq!(config.scheduling_strategy, SchedulingStrategy::Fifo);
    }

    #[test]
    fn capabilities_env_must_be_json_object() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(ENV_WORKER_ID, "w1");
        std::env::set_var(ENV_CAPABILITIES, r#"["gpu"]"#);
        let result = WorkerConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(QueueError::Validation(_))));
    }
}
