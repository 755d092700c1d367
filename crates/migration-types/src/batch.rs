//! Batch definitions.

use crate::BatchStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default values seeded into new batches.
pub mod defaults {
    /// Default target name.
    pub const DEFAULT_TARGET: &str = "default";

    /// Default target project.
    pub const DEFAULT_PROJECT: &str = "default";

    /// Default storage pool.
    pub const DEFAULT_STORAGE_POOL: &str = "default";

    /// Default interval between background syncs, in seconds.
    pub const BACKGROUND_SYNC_INTERVAL_SECS: u64 = 600;

    /// Default number of concurrent final syncs per batch.
    pub const FINAL_SYNC_LIMIT: usize = 10;
}

/// Placement applied when no scriptlet overrides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDefaults {
    pub target: String,
    pub target_project: String,
    pub storage_pool: String,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            target: defaults::DEFAULT_TARGET.to_string(),
            target_project: defaults::DEFAULT_PROJECT.to_string(),
            storage_pool: defaults::DEFAULT_STORAGE_POOL.to_string(),
        }
    }
}

/// Restrictions lifted for every instance of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictionOverrides {
    pub allow_no_nics: bool,
    pub allow_no_ipv4: bool,
    pub allow_unknown_os: bool,
    pub allow_unsupported_disks: bool,
}

/// Tunables of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub background_sync_interval_secs: u64,
    /// Maximum number of instances of the batch in final import at once.
    pub final_sync_limit: usize,
    /// YAML placement rule table.
    pub placement_scriptlet: Option<String>,
    /// Re-run the scriptlet on every placement pass instead of only the first.
    pub rerun_scriptlets: bool,
    pub restriction_overrides: RestrictionOverrides,
    /// Delete half-created target VMs on failure and retry later.
    pub cleanup_on_failure: bool,
}

impl BatchConfig {
    pub fn background_sync_interval(&self) -> Duration {
        Duration::from_secs(self.background_sync_interval_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            background_sync_interval_secs: defaults::BACKGROUND_SYNC_INTERVAL_SECS,
            final_sync_limit: defaults::FINAL_SYNC_LIMIT,
            placement_scriptlet: None,
            rerun_scriptlets: false,
            restriction_overrides: RestrictionOverrides::default(),
            cleanup_on_failure: true,
        }
    }
}

/// Limits how many matching instances may be in flight at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub include_expression: String,
    pub max_concurrent_instances: Option<usize>,
}

/// Time range during which the offline cutover may happen.
///
/// All bounds are optional; a window without `start` is open immediately and
/// a window without `end` never closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// No final import may begin after this point.
    pub lockout: Option<DateTime<Utc>>,
}

impl MigrationWindow {
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| now >= end)
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| now >= start) && !self.has_ended(now)
    }

    /// Returns true if a final import may begin at `now`.
    pub fn allows_final_import(&self, now: DateTime<Utc>) -> bool {
        self.is_open(now) && self.lockout.map_or(true, |lockout| now < lockout)
    }

    /// Returns true if the bounds are internally consistent.
    pub fn is_well_formed(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start < end,
            _ => true,
        }
    }
}

/// A named group of instances migrated together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub name: String,
    pub status: BatchStatus,
    pub status_message: String,
    /// Membership filter over instance properties.
    pub include_expression: String,
    pub defaults: BatchDefaults,
    pub constraints: Vec<Constraint>,
    pub config: BatchConfig,
    pub migration_windows: Vec<MigrationWindow>,
}

impl Batch {
    pub fn new(name: impl Into<String>, include_expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: BatchStatus::Defined,
            status_message: String::new(),
            include_expression: include_expression.into(),
            defaults: BatchDefaults::default(),
            constraints: Vec::new(),
            config: BatchConfig::default(),
            migration_windows: Vec::new(),
        }
    }

    /// Returns true if the batch can still migrate: no windows configured, or
    /// at least one well-formed window that has not ended.
    pub fn windows_valid(&self, now: DateTime<Utc>) -> bool {
        if self.migration_windows.is_empty() {
            return true;
        }

        self.migration_windows
            .iter()
            .any(|w| w.is_well_formed() && !w.has_ended(now))
    }

    /// Returns true if a final import may begin at `now`.
    pub fn final_import_allowed(&self, now: DateTime<Utc>) -> bool {
        if self.migration_windows.is_empty() {
            return true;
        }

        self.migration_windows
            .iter()
            .any(|w| w.allows_final_import(now))
    }
}
