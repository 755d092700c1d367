//! Target VM definitions.
//!
//! A definition describes the VM shell created before any data is copied:
//! empty disks sized like the source disks, NICs with the source hardware
//! addresses but no network yet, the worker volume to boot from, and the
//! migration-control device the worker uses to reach the engine.

use migration_types::{Instance, OsType, Placement, QueueEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Device name of the migration-control device.
pub const MIGRATION_CONTROL_DEVICE: &str = "migration-control";

/// Device name of the attached worker volume.
pub const WORKER_DEVICE: &str = "migration-worker";

/// Device name of the Windows driver ISO.
pub const DRIVERS_DEVICE: &str = "drivers";

/// A device of the target VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Device {
    Disk {
        pool: String,
        size_bytes: u64,
        boot_priority: Option<u32>,
    },
    /// Custom volume attached as a disk (worker volume, driver ISO).
    Volume {
        pool: String,
        volume: String,
        boot_priority: Option<u32>,
    },
    /// NIC placeholder carrying the source hardware address, not yet wired.
    Nic { hardware_address: String },
    MigrationControl {
        token: Uuid,
        server_fingerprint: String,
        endpoint: String,
    },
    Tpm,
}

/// Everything needed to build a definition.
#[derive(Debug, Clone, Copy)]
pub struct DefinitionRequest<'a> {
    pub instance: &'a Instance,
    pub placement: &'a Placement,
    pub entry: &'a QueueEntry,
    pub server_fingerprint: &'a str,
    pub worker_endpoint: &'a str,
    /// Name of the imported driver ISO volume, for Windows guests.
    pub driver_iso: Option<&'a str>,
}

/// Target-side VM definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub name: String,
    pub project: String,
    pub architecture: String,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, Device>,
}

impl VmDefinition {
    /// Builds the definition for `request.instance`.
    pub fn build(request: &DefinitionRequest<'_>) -> Self {
        let instance = request.instance;
        let placement = request.placement;
        let props = &instance.properties;

        let mut config = BTreeMap::new();
        config.insert("limits.cpu".to_string(), instance.effective_cpus().to_string());
        config.insert(
            "limits.memory".to_string(),
            format!("{}B", instance.effective_memory_bytes()),
        );
        config.insert("image.os".to_string(), props.os.clone());
        config.insert("image.release".to_string(), props.os_version.clone());
        config.insert("image.architecture".to_string(), props.architecture.clone());
        config.insert("user.migration.source".to_string(), instance.source.clone());
        config.insert("user.migration.location".to_string(), props.location.clone());

        if props.legacy_boot {
            config.insert("security.csm".to_string(), "true".to_string());
            config.insert("security.secureboot".to_string(), "false".to_string());
        } else {
            config.insert("security.secureboot".to_string(), props.secure_boot.to_string());
        }

        let mut devices = BTreeMap::new();
        for (index, disk) in props.disks.iter().enumerate() {
            let name = if index == 0 {
                "root".to_string()
            } else {
                format!("disk{}", index)
            };
            let pool = placement
                .storage_pools
                .get(&disk.name)
                .cloned()
                .unwrap_or_default();
            devices.insert(
                name,
                Device::Disk {
                    pool,
                    size_bytes: disk.capacity_bytes,
                    boot_priority: None,
                },
            );
        }

        for (index, nic) in props.nics.iter().enumerate() {
            devices.insert(
                format!("eth{}", index),
                Device::Nic {
                    hardware_address: nic.hardware_address.clone(),
                },
            );
        }

        let root_pool = placement.root_pool().unwrap_or_default().to_string();
        devices.insert(
            WORKER_DEVICE.to_string(),
            Device::Volume {
                pool: root_pool.clone(),
                volume: instance.worker_volume_name(),
                boot_priority: Some(10),
            },
        );

        if props.os_type == OsType::Windows {
            if let Some(iso) = request.driver_iso {
                devices.insert(
                    DRIVERS_DEVICE.to_string(),
                    Device::Volume {
                        pool: root_pool,
                        volume: iso.to_string(),
                        boot_priority: None,
                    },
                );
            }
        }

        if props.tpm {
            devices.insert("vtpm".to_string(), Device::Tpm);
        }

        devices.insert(
            MIGRATION_CONTROL_DEVICE.to_string(),
            Device::MigrationControl {
                token: request.entry.secret_token,
                server_fingerprint: request.server_fingerprint.to_string(),
                endpoint: request.worker_endpoint.to_string(),
            },
        );

        Self {
            name: props.name.clone(),
            project: placement.target_project.clone(),
            architecture: props.architecture.clone(),
            config,
            devices,
        }
    }

    /// Names of the NIC placeholder devices in hardware-address order of the source.
    pub fn nic_devices(&self) -> impl Iterator<Item = (&String, &String)> {
        self.devices.iter().filter_map(|(name, device)| match device {
            Device::Nic { hardware_address } => Some((name, hardware_address)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration_types::{Disk, InstanceProperties, Nic, SourceType};
    use pretty_assertions::assert_eq;

    fn windows_instance() -> Instance {
        Instance::new(
            Uuid::new_v4(),
            "vcenter",
            SourceType::Vmware,
            InstanceProperties {
                name: "win01".into(),
                location: "/dc/vm/win01".into(),
                cpus: 4,
                memory_bytes: 8 << 30,
                os: "windows".into(),
                os_version: "2022".into(),
                os_type: OsType::Windows,
                architecture: "x86_64".into(),
                disks: vec![
                    Disk { name: "disk-a".into(), capacity_bytes: 40 << 30, supported: true },
                    Disk { name: "disk-b".into(), capacity_bytes: 10 << 30, supported: true },
                ],
                nics: vec![Nic {
                    hardware_address: "00:50:56:aa:bb:cc".into(),
                    network_id: "net-1".into(),
                    ipv4_address: Some("10.0.0.5".into()),
                    ipv6_address: None,
                }],
                tpm: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_build_definition() {
        let instance = windows_instance();
        let mut placement = Placement {
            target: "incus".into(),
            target_project: "prod".into(),
            ..Default::default()
        };
        placement.storage_pools.insert("disk-a".into(), "fast".into());
        placement.storage_pools.insert("disk-b".into(), "slow".into());
        let entry = QueueEntry::new(instance.uuid, "wave-1");

        let def = VmDefinition::build(&DefinitionRequest {
            instance: &instance,
            placement: &placement,
            entry: &entry,
            server_fingerprint: "abcd",
            worker_endpoint: "https://10.0.0.1:6443",
            driver_iso: Some("virtio-win.iso"),
        });

        assert_eq!(def.name, "win01");
        assert_eq!(def.project, "prod");
        assert_eq!(def.config["limits.cpu"], "4");
        assert_eq!(
            def.devices["root"],
            Device::Disk { pool: "fast".into(), size_bytes: 40 << 30, boot_priority: None }
        );
        assert_eq!(
            def.devices["disk1"],
            Device::Disk { pool: "slow".into(), size_bytes: 10 << 30, boot_priority: None }
        );
        assert!(def.devices.contains_key(DRIVERS_DEVICE));
        assert!(def.devices.contains_key("vtpm"));
        assert_eq!(
            def.devices[MIGRATION_CONTROL_DEVICE],
            Device::MigrationControl {
                token: entry.secret_token,
                server_fingerprint: "abcd".into(),
                endpoint: "https://10.0.0.1:6443".into(),
            }
        );
        assert_eq!(def.nic_devices().count(), 1);
    }

    #[test]
    fn test_legacy_boot_disables_secureboot() {
        let mut instance = windows_instance();
        instance.properties.legacy_boot = true;
        instance.properties.secure_boot = true;
        let placement = Placement::default();
        let entry = QueueEntry::new(instance.uuid, "b");

        let def = VmDefinition::build(&DefinitionRequest {
            instance: &instance,
            placement: &placement,
            entry: &entry,
            server_fingerprint: "",
            worker_endpoint: "",
            driver_iso: None,
        });

        assert_eq!(def.config["security.csm"], "true");
        assert_eq!(def.config["security.secureboot"], "false");
        assert!(!def.devices.contains_key(DRIVERS_DEVICE));
    }
}
