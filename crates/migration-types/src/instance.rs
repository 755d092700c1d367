//! Source VM instances.

use crate::{MigrationStatus, ParseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Guest operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
    /// Vendor appliance booted from a vendor-supplied OS image.
    Appliance,
    #[default]
    Unknown,
}

impl OsType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Windows => "windows",
            OsType::Appliance => "appliance",
            OsType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(OsType::Linux),
            "windows" => Ok(OsType::Windows),
            "appliance" => Ok(OsType::Appliance),
            "unknown" | "" => Ok(OsType::Unknown),
            _ => Err(ParseError::InvalidOsType(s.to_string())),
        }
    }
}

/// A virtual disk of the source VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub capacity_bytes: u64,
    /// False for disk kinds the worker cannot copy (raw device mappings etc).
    pub supported: bool,
}

/// A network interface of the source VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub hardware_address: String,
    /// Identifier of the source network the NIC is attached to.
    pub network_id: String,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Descriptive properties read from the source inventory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceProperties {
    pub name: String,
    /// Inventory path of the VM at the source.
    pub location: String,
    pub description: String,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub os: String,
    pub os_version: String,
    pub os_type: OsType,
    pub architecture: String,
    pub disks: Vec<Disk>,
    pub nics: Vec<Nic>,
    pub snapshots: Vec<Snapshot>,
    pub legacy_boot: bool,
    pub secure_boot: bool,
    pub tpm: bool,
    /// Power state at the source when last synced.
    pub running: bool,
}

/// Per-instance operator overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceOverrides {
    pub disable_migration: bool,
    pub ignore_restrictions: bool,
    pub cpus: Option<u32>,
    pub memory_bytes: Option<u64>,
    /// Target network per NIC hardware address.
    pub networks: BTreeMap<String, String>,
}

/// A VM known from a source inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: Uuid,
    pub source: String,
    pub source_type: crate::SourceType,
    pub properties: InstanceProperties,
    pub migration_status: MigrationStatus,
    pub migration_status_message: String,
    pub overrides: InstanceOverrides,
    pub batch: Option<String>,
    pub last_update_from_source: DateTime<Utc>,
    pub last_update_from_worker: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(
        uuid: Uuid,
        source: impl Into<String>,
        source_type: crate::SourceType,
        properties: InstanceProperties,
    ) -> Self {
        Self {
            uuid,
            source: source.into(),
            source_type,
            properties,
            migration_status: MigrationStatus::NotAssignedBatch,
            migration_status_message: String::new(),
            overrides: InstanceOverrides::default(),
            batch: None,
            last_update_from_source: Utc::now(),
            last_update_from_worker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    /// CPU count after applying overrides.
    pub fn effective_cpus(&self) -> u32 {
        self.overrides.cpus.unwrap_or(self.properties.cpus)
    }

    /// Memory size after applying overrides.
    pub fn effective_memory_bytes(&self) -> u64 {
        self.overrides
            .memory_bytes
            .unwrap_or(self.properties.memory_bytes)
    }

    /// Name of the per-instance worker volume created on the target.
    ///
    /// Its presence in a target pool shows that a VM shell was (partially)
    /// created for this instance.
    pub fn worker_volume_name(&self) -> String {
        format!("{}-worker", self.properties.name)
    }
}
