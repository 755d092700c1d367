//! Reconfiguration applied to a VM once its data is fully imported.

use crate::definition::{DRIVERS_DEVICE, MIGRATION_CONTROL_DEVICE, WORKER_DEVICE};
use migration_types::{Instance, OsType, Placement};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const RHEL_FAMILY: [&str; 6] = ["rhel", "redhat", "centos", "rocky", "alma", "oracle"];

/// Changes turning a migration shell into the final VM.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostMigrationConfig {
    /// Target network per NIC device name.
    pub nic_networks: BTreeMap<String, String>,
    pub remove_devices: Vec<String>,
    pub set_config: BTreeMap<String, String>,
    pub unset_config: Vec<String>,
}

impl PostMigrationConfig {
    /// Computes the reconfiguration for `instance` placed at `placement`.
    ///
    /// NIC placeholders are named `eth<N>` in source NIC order, matching
    /// [`VmDefinition::build`](crate::VmDefinition::build).
    pub fn build(instance: &Instance, placement: &Placement) -> Self {
        let props = &instance.properties;
        let mut config = Self::default();

        for (index, nic) in props.nics.iter().enumerate() {
            if let Some(network) = placement.networks.get(&nic.hardware_address) {
                config
                    .nic_networks
                    .insert(format!("eth{}", index), network.clone());
            }
        }

        config.remove_devices = vec![
            MIGRATION_CONTROL_DEVICE.to_string(),
            WORKER_DEVICE.to_string(),
            DRIVERS_DEVICE.to_string(),
        ];

        match props.os_type {
            OsType::Windows => {
                config.set_config.insert("image.os".into(), "Windows".into());
                if let Some(release) = windows_release(&props.os, &props.os_version) {
                    config.set_config.insert("image.release".into(), release);
                }
            }
            OsType::Linux if is_rhel_family(&props.os) => {
                // Older RHEL kernels lack the vsock transport for the agent.
                config
                    .set_config
                    .insert("user.agent.channel".into(), "virtio-serial".into());
            }
            _ => {}
        }

        config
            .set_config
            .insert("volatile.uuid".into(), instance.uuid.to_string());
        if !props.description.is_empty() {
            config
                .set_config
                .insert("user.description".into(), props.description.clone());
        }
        config.unset_config.push("user.migration.token".into());

        config
    }
}

fn is_rhel_family(os: &str) -> bool {
    let os = os.to_lowercase();
    RHEL_FAMILY.iter().any(|family| os.contains(family))
}

/// Extracts the release number from names such as "Microsoft Windows Server
/// 2019" or "windows11_64Guest".
fn windows_release(os: &str, os_version: &str) -> Option<String> {
    [os_version, os].iter().find_map(|text| {
        let digits: String = text
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        (!digits.is_empty() && digits != "64").then_some(digits)
    })
}
