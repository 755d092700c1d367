//! Target hypervisor interface.

use crate::{DefinitionRequest, EndpointResult, PostMigrationConfig, VmDefinition};
use async_trait::async_trait;
use migration_types::{Instance, Placement};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Point-in-time read of what a target offers.
///
/// Fetched fresh for every orchestration pass, never cached across passes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetDetails {
    pub projects: BTreeSet<String>,
    pub storage_pools: BTreeSet<String>,
    pub networks_by_project: BTreeMap<String, BTreeSet<String>>,
    pub instances_by_project: BTreeMap<String, BTreeSet<String>>,
}

impl TargetDetails {
    pub fn has_project(&self, project: &str) -> bool {
        self.projects.contains(project)
    }

    pub fn has_storage_pool(&self, pool: &str) -> bool {
        self.storage_pools.contains(pool)
    }

    pub fn has_network(&self, project: &str, network: &str) -> bool {
        self.networks_by_project
            .get(project)
            .is_some_and(|nets| nets.contains(network))
    }

    pub fn has_instance(&self, project: &str, name: &str) -> bool {
        self.instances_by_project
            .get(project)
            .is_some_and(|names| names.contains(name))
    }
}

/// A long-running operation started on the target.
#[async_trait]
pub trait TargetOperation: Send {
    /// Operation identifier, for logging.
    fn id(&self) -> &str;

    /// Waits until the operation completes.
    async fn wait(&mut self) -> EndpointResult<()>;
}

/// Connection to one target hypervisor environment.
///
/// A handle is bound to one project at a time (see [`set_project`]), so
/// callers acting on different projects use separate handles.
///
/// [`set_project`]: TargetEndpoint::set_project
#[async_trait]
pub trait TargetEndpoint: Send + Sync {
    /// Name of the target in the catalog.
    fn name(&self) -> &str;

    async fn connect(&self) -> EndpointResult<()>;

    /// Selects the project subsequent calls act on.
    async fn set_project(&self, project: &str) -> EndpointResult<()>;

    /// Reads the current capability snapshot.
    async fn get_details(&self) -> EndpointResult<TargetDetails>;

    /// Builds the VM definition for an instance.
    fn create_vm_definition(&self, request: &DefinitionRequest<'_>) -> VmDefinition {
        VmDefinition::build(request)
    }

    /// Creates the VM shell. The per-instance worker volume is created with it.
    async fn create_new_vm(
        &self,
        instance: &Instance,
        definition: &VmDefinition,
        placement: &Placement,
        boot_iso: Option<&str>,
    ) -> EndpointResult<()>;

    async fn start_vm(&self, name: &str) -> EndpointResult<()>;

    /// Succeeds once the in-guest agent channel of the VM answers.
    async fn check_agent(&self, name: &str) -> EndpointResult<()>;

    /// Imports a volume backup file; returns the operations to await.
    async fn create_storage_pool_volume_from_backup(
        &self,
        pool: &str,
        volume: &str,
        path: &Path,
    ) -> EndpointResult<Vec<Box<dyn TargetOperation>>>;

    /// Imports an ISO file as a custom volume.
    async fn create_storage_pool_volume_from_iso(
        &self,
        pool: &str,
        volume: &str,
        path: &Path,
    ) -> EndpointResult<Box<dyn TargetOperation>>;

    async fn get_storage_pool_volume_names(&self, pool: &str) -> EndpointResult<Vec<String>>;

    /// Deletes the VM together with its volumes.
    async fn delete_vm(&self, name: &str) -> EndpointResult<()>;

    /// Applies the post-migration reconfiguration to a migrated VM.
    async fn set_post_migration_vm_config(
        &self,
        instance: &Instance,
        config: &PostMigrationConfig,
    ) -> EndpointResult<()>;
}
