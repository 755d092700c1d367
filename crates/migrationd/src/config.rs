//! Daemon configuration.
//!
//! Loaded from a YAML file; every field has a default so an empty or
//! missing file yields a working configuration. Command-line flags override
//! the file (see `main.rs`).

use crate::error::{MigrationError, MigrationResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-phase tick intervals, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub sync_secs: u64,
    pub queue_secs: u64,
    pub provision_secs: u64,
    pub finalize_secs: u64,
    pub liveness_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            sync_secs: 600,
            queue_secs: 10,
            provision_secs: 10,
            finalize_secs: 10,
            liveness_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: PathBuf,
    pub artifacts_dir: PathBuf,
    /// URL workers use to reach the engine.
    pub worker_endpoint: String,
    /// TLS fingerprint of the engine, handed to workers.
    pub server_fingerprint: String,
    pub intervals: IntervalConfig,
    /// Worker silence tolerated before an instance is errored.
    pub worker_timeout_secs: u64,
    /// Bound on waiting for the in-guest agent after VM start.
    pub agent_timeout_secs: u64,
    pub agent_poll_interval_ms: u64,
    /// Bound on connecting to the worker endpoint when starting a batch.
    pub connect_timeout_secs: u64,
    /// Concurrent VM creations per batch when the target sets no limit.
    pub default_create_limit: usize,
    /// Emit logs as JSON lines.
    pub json_logs: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/migrationd/migrationd.db"),
            artifacts_dir: PathBuf::from("/var/lib/migrationd/artifacts"),
            worker_endpoint: "https://127.0.0.1:8443".to_string(),
            server_fingerprint: String::new(),
            intervals: IntervalConfig::default(),
            worker_timeout_secs: 30,
            agent_timeout_secs: 90,
            agent_poll_interval_ms: 1000,
            connect_timeout_secs: 5,
            default_create_limit: 8,
            json_logs: false,
        }
    }
}

impl DaemonConfig {
    /// Reads the configuration from `path`.
    pub fn load(path: &Path) -> MigrationResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> MigrationResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| MigrationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MigrationResult<()> {
        if self.default_create_limit == 0 {
            return Err(MigrationError::Config(
                "default_create_limit must be at least 1".to_string(),
            ));
        }

        let intervals = &self.intervals;
        if [
            intervals.sync_secs,
            intervals.queue_secs,
            intervals.provision_secs,
            intervals.finalize_secs,
            intervals.liveness_secs,
        ]
        .contains(&0)
        {
            return Err(MigrationError::Config("phase intervals must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn agent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.agent_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
