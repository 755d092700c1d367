//! Placement resolution.
//!
//! Turns an instance of a batch into a [`Placement`]: the target, target
//! project, a storage pool per disk and a network per NIC. Resolution
//! itself is pure; [`validate`] then checks the result against a fresh
//! capability snapshot of the chosen target.

pub mod restrictions;
pub mod scriptlet;

use crate::error::MigrationResult;
use migration_endpoint::TargetDetails;
use migration_orch_common::{TaskError, TaskResult};
use migration_types::{Batch, Instance, Placement};
use scriptlet::{PlacementDraft, Scriptlet};
use std::collections::BTreeMap;

/// Resolves placements for the instances of one batch.
pub struct PlacementResolver<'a> {
    batch: &'a Batch,
    scriptlet: Option<Scriptlet>,
}

impl<'a> PlacementResolver<'a> {
    /// Compiles the batch scriptlet, if any.
    pub fn new(batch: &'a Batch) -> MigrationResult<Self> {
        let scriptlet = batch
            .config
            .placement_scriptlet
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(Scriptlet::compile)
            .transpose()?;

        Ok(Self { batch, scriptlet })
    }

    /// Computes the placement of `instance`.
    ///
    /// `existing` is the placement stored on a previous pass. It is kept as
    /// is when the batch has a scriptlet that is not set to rerun.
    /// `catalog_networks` maps source network identifiers to target network
    /// names and provides the NIC defaults.
    pub fn resolve(
        &self,
        instance: &Instance,
        existing: Option<&Placement>,
        catalog_networks: &BTreeMap<String, String>,
    ) -> TaskResult<Placement> {
        let draft = match (&self.scriptlet, existing) {
            (Some(_), Some(existing))
                if !existing.target.is_empty() && !self.batch.config.rerun_scriptlets =>
            {
                return Ok(existing.clone());
            }
            (Some(scriptlet), _) => scriptlet.evaluate(instance),
            (None, _) => PlacementDraft::default(),
        };

        let defaults = &self.batch.defaults;
        let mut placement = Placement {
            target: draft.target.unwrap_or_else(|| defaults.target.clone()),
            target_project: draft
                .project
                .unwrap_or_else(|| defaults.target_project.clone()),
            ..Default::default()
        };

        let default_pool = draft
            .pool
            .unwrap_or_else(|| defaults.storage_pool.clone());
        for disk in &instance.properties.disks {
            let pool = draft
                .pools
                .get(&disk.name)
                .cloned()
                .unwrap_or_else(|| default_pool.clone());
            placement.storage_pools.insert(disk.name.clone(), pool);
        }

        for nic in &instance.properties.nics {
            let network = draft
                .networks
                .get(&nic.hardware_address)
                .or(draft.network.as_ref())
                .or_else(|| instance.overrides.networks.get(&nic.hardware_address))
                .or_else(|| catalog_networks.get(&nic.network_id))
                .ok_or_else(|| {
                    TaskError::validation(format!(
                        "No target network known for NIC {} (source network {})",
                        nic.hardware_address, nic.network_id
                    ))
                })?;
            placement
                .networks
                .insert(nic.hardware_address.clone(), network.clone());
        }

        Ok(placement)
    }
}

/// Checks a placement against the target capability snapshot.
///
/// The project, every pool and every network must exist, and the instance
/// name must still be free in the project.
pub fn validate(placement: &Placement, instance: &Instance, details: &TargetDetails) -> TaskResult<()> {
    let project = &placement.target_project;
    if !details.has_project(project) {
        return Err(TaskError::validation(format!(
            "Project {} does not exist on target {}",
            project, placement.target
        )));
    }

    for (disk, pool) in &placement.storage_pools {
        if !details.has_storage_pool(pool) {
            return Err(TaskError::validation(format!(
                "Storage pool {} for disk {} does not exist on target {}",
                pool, disk, placement.target
            )));
        }
    }

    for (hwaddr, network) in &placement.networks {
        if !details.has_network(project, network) {
            return Err(TaskError::validation(format!(
                "Network {} for NIC {} does not exist in project {}",
                network, hwaddr, project
            )));
        }
    }

    if details.has_instance(project, instance.name()) {
        return Err(TaskError::validation(format!(
            "Instance {} already exists in project {}",
            instance.name(),
            project
        )));
    }

    Ok(())
}
