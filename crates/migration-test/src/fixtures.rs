//! Fixtures for common migration scenarios.
//!
//! Every instance fixture has one supported disk and one NIC with an IPv4
//! address attached to [`SOURCE_NETWORK`], so it passes the migration
//! restrictions and places onto [`target_details`] unchanged.

use migration_endpoint::TargetDetails;
use migration_types::{
    Artifact, ArtifactType, Batch, Disk, Instance, InstanceProperties, Network, Nic, OsType,
    Source, SourceType, Target, TargetType,
};
use uuid::Uuid;

pub const SOURCE: &str = "vcenter";
pub const TARGET: &str = "incus";
pub const PROJECT: &str = "default";
pub const POOL: &str = "default";
/// Source network every fixture NIC is attached to.
pub const SOURCE_NETWORK: &str = "network-1";
/// Target network [`SOURCE_NETWORK`] maps to.
pub const TARGET_NETWORK: &str = "prod";

pub fn source() -> Source {
    Source {
        name: SOURCE.to_string(),
        source_type: SourceType::Vmware,
        properties: serde_json::json!({
            "endpoint": "https://vcenter.example.com",
            "username": "migration",
        }),
    }
}

pub fn target() -> Target {
    Target {
        name: TARGET.to_string(),
        target_type: TargetType::Incus,
        properties: serde_json::json!({ "endpoint": "https://incus.example.com:8443" }),
        create_limit: None,
    }
}

/// Capability snapshot with [`PROJECT`], [`POOL`] and [`TARGET_NETWORK`].
pub fn target_details() -> TargetDetails {
    let mut details = TargetDetails::default();
    details.projects.insert(PROJECT.to_string());
    details.storage_pools.insert(POOL.to_string());
    details
        .networks_by_project
        .entry(PROJECT.to_string())
        .or_default()
        .insert(TARGET_NETWORK.to_string());
    details
}

/// Catalog entry for [`SOURCE_NETWORK`].
pub fn source_network() -> Network {
    Network {
        identifier: SOURCE_NETWORK.to_string(),
        location: "/dc1/network/VM Network".to_string(),
        source: SOURCE.to_string(),
        name: TARGET_NETWORK.to_string(),
        target_network: None,
    }
}

/// A running Linux VM of [`SOURCE`].
pub fn linux_instance(name: &str) -> Instance {
    instance(name, OsType::Linux, "ubuntu")
}

/// A running Windows VM of [`SOURCE`].
pub fn windows_instance(name: &str) -> Instance {
    instance(name, OsType::Windows, "windows")
}

fn instance(name: &str, os_type: OsType, os: &str) -> Instance {
    Instance::new(
        Uuid::new_v4(),
        SOURCE,
        SourceType::Vmware,
        InstanceProperties {
            name: name.to_string(),
            location: format!("/dc1/vm/{}", name),
            description: format!("{} test VM", name),
            cpus: 2,
            memory_bytes: 4 << 30,
            os: os.to_string(),
            os_version: "22.04".to_string(),
            os_type,
            architecture: "x86_64".to_string(),
            disks: vec![Disk {
                name: "Hard disk 1".to_string(),
                capacity_bytes: 20 << 30,
                supported: true,
            }],
            nics: vec![Nic {
                hardware_address: format!("00:50:56:00:00:{:02x}", name.len()),
                network_id: SOURCE_NETWORK.to_string(),
                ipv4_address: Some("10.0.0.10".to_string()),
                ipv6_address: None,
            }],
            running: true,
            ..Default::default()
        },
    )
}

/// Batch placing onto [`TARGET`] / [`PROJECT`] / [`POOL`].
pub fn batch(name: &str, include_expression: &str) -> Batch {
    let mut batch = Batch::new(name, include_expression);
    batch.defaults.target = TARGET.to_string();
    batch.defaults.target_project = PROJECT.to_string();
    batch.defaults.storage_pool = POOL.to_string();
    batch
}

pub fn worker_artifact() -> Artifact {
    let mut artifact = Artifact::new(ArtifactType::Worker);
    artifact.description = "migration worker image".to_string();
    artifact
}

pub fn sdk_artifact(source_type: SourceType) -> Artifact {
    let mut artifact = Artifact::new(ArtifactType::Sdk);
    artifact.description = format!("{} SDK", source_type);
    artifact.source_type = Some(source_type);
    artifact
}

pub fn driver_iso_artifact(architecture: &str) -> Artifact {
    let mut artifact = Artifact::new(ArtifactType::DriverIso);
    artifact.description = "virtio drivers".to_string();
    artifact.os = Some("windows".to_string());
    artifact.architectures = vec![architecture.to_string()];
    artifact
}
