//! Queue entries and resolved placements.

use crate::{ImportStage, MigrationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Where an instance lands on the target side.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Placement {
    pub target: String,
    pub target_project: String,
    /// Storage pool per source disk name.
    pub storage_pools: BTreeMap<String, String>,
    /// Target network per NIC hardware address.
    pub networks: BTreeMap<String, String>,
}

impl Placement {
    /// Pool of the first disk, used for shared assets such as the worker image.
    pub fn root_pool(&self) -> Option<&str> {
        self.storage_pools.values().next().map(String::as_str)
    }
}

/// One migration attempt of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub instance_uuid: Uuid,
    pub batch_name: String,
    pub migration_status: MigrationStatus,
    pub migration_status_message: String,
    pub import_stage: ImportStage,
    pub placement: Placement,
    /// Authenticates the in-guest worker of this entry only.
    pub secret_token: Uuid,
    pub last_worker_update: Option<DateTime<Utc>>,
    pub last_background_sync: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Creates a new entry with a fresh secret token.
    pub fn new(instance_uuid: Uuid, batch_name: impl Into<String>) -> Self {
        Self {
            instance_uuid,
            batch_name: batch_name.into(),
            migration_status: MigrationStatus::Waiting,
            migration_status_message: String::new(),
            import_stage: ImportStage::Background,
            placement: Placement::default(),
            secret_token: Uuid::new_v4(),
            last_worker_update: None,
            last_background_sync: None,
        }
    }
}
