//! Instance restrictions checked before placement.

use migration_orch_common::{TaskError, TaskResult};
use migration_types::{Instance, OsType, RestrictionOverrides};

/// Checks whether `instance` may be migrated at all.
///
/// A disabled instance is always refused. The remaining checks can be
/// lifted per batch through `overrides` or per instance through the
/// `ignore_restrictions` override.
pub fn check(instance: &Instance, overrides: &RestrictionOverrides) -> TaskResult<()> {
    if instance.overrides.disable_migration {
        return Err(TaskError::validation("Migration is disabled for this instance"));
    }

    if instance.overrides.ignore_restrictions {
        return Ok(());
    }

    let props = &instance.properties;

    if props.nics.is_empty() && !overrides.allow_no_nics {
        return Err(TaskError::validation("Instance has no NICs"));
    }

    if !overrides.allow_no_ipv4 {
        if let Some(nic) = props.nics.iter().find(|nic| nic.ipv4_address.is_none()) {
            return Err(TaskError::validation(format!(
                "NIC {} has no IPv4 address",
                nic.hardware_address
            )));
        }
    }

    if props.os_type == OsType::Unknown && !overrides.allow_unknown_os {
        return Err(TaskError::validation(format!(
            "Unable to determine OS type of \"{}\"",
            props.os
        )));
    }

    if !overrides.allow_unsupported_disks {
        if let Some(disk) = props.disks.iter().find(|disk| !disk.supported) {
            return Err(TaskError::validation(format!(
                "Disk {} is not supported for migration",
                disk.name
            )));
        }
    }

    Ok(())
}
