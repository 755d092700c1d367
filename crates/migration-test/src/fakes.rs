//! In-memory endpoints.
//!
//! A [`FakeTarget`] handle is cheap and shares a [`TargetState`] with every
//! other handle of the same target, the way separate connections to one
//! real target observe the same server. Tests inspect and mutate the state
//! directly to inject failures and check what the engine did.

use async_trait::async_trait;
use migration_endpoint::{
    EndpointError, EndpointFactory, EndpointResult, PostMigrationConfig, SourceEndpoint,
    TargetDetails, TargetEndpoint, TargetOperation, VmDefinition,
};
use migration_types::{Instance, Network, Placement, Source, Target};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Server-side state of a fake target.
#[derive(Debug, Default)]
pub struct TargetState {
    pub details: TargetDetails,
    /// Volume names per storage pool.
    pub volumes: BTreeMap<String, BTreeSet<String>>,
    pub vms: BTreeMap<String, VmDefinition>,
    /// Boot ISO passed when each VM was created.
    pub boot_isos: BTreeMap<String, Option<String>>,
    pub started: BTreeSet<String>,
    pub deleted: Vec<String>,
    pub post_migration: BTreeMap<String, PostMigrationConfig>,

    pub connect_calls: usize,
    pub create_calls: usize,
    pub imports: usize,
    pub active_imports: usize,
    pub max_concurrent_imports: usize,
    pub active_creates: usize,
    pub max_concurrent_creates: usize,

    /// Connections fail while set.
    pub unreachable: bool,
    /// VMs whose start fails.
    pub fail_start: BTreeSet<String>,
    /// VMs whose agent never answers.
    pub silent_agents: BTreeSet<String>,
    /// How long an import operation takes.
    pub import_delay: Duration,
    /// How long creating a VM takes.
    pub create_delay: Duration,
}

impl TargetState {
    pub fn new(details: TargetDetails) -> Self {
        Self {
            details,
            import_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    pub fn has_volume(&self, pool: &str, volume: &str) -> bool {
        self.volumes
            .get(pool)
            .is_some_and(|names| names.contains(volume))
    }

    pub fn add_volume(&mut self, pool: &str, volume: &str) {
        self.volumes
            .entry(pool.to_string())
            .or_default()
            .insert(volume.to_string());
    }
}

pub struct FakeTarget {
    name: String,
    state: Arc<Mutex<TargetState>>,
    project: Mutex<Option<String>>,
}

impl FakeTarget {
    pub fn new(name: impl Into<String>, state: Arc<Mutex<TargetState>>) -> Self {
        Self {
            name: name.into(),
            state,
            project: Mutex::new(None),
        }
    }

    pub fn project(&self) -> Option<String> {
        self.project.lock().clone()
    }

    fn check_reachable(&self) -> EndpointResult<()> {
        if self.state.lock().unreachable {
            return Err(EndpointError::connection(&self.name, "connection refused"));
        }
        Ok(())
    }

    fn start_import(&self, pool: &str, volume: &str) -> Box<dyn TargetOperation> {
        let delay = {
            let mut state = self.state.lock();
            state.imports += 1;
            state.active_imports += 1;
            state.max_concurrent_imports = state.max_concurrent_imports.max(state.active_imports);
            state.import_delay
        };

        Box::new(FakeOperation {
            id: format!("import/{}/{}", pool, volume),
            pool: pool.to_string(),
            volume: volume.to_string(),
            delay,
            state: Arc::clone(&self.state),
            done: false,
        })
    }
}

#[async_trait]
impl TargetEndpoint for FakeTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> EndpointResult<()> {
        self.state.lock().connect_calls += 1;
        self.check_reachable()
    }

    async fn set_project(&self, project: &str) -> EndpointResult<()> {
        self.check_reachable()?;
        if !self.state.lock().details.has_project(project) {
            return Err(EndpointError::not_found(format!("project {}", project)));
        }
        *self.project.lock() = Some(project.to_string());
        Ok(())
    }

    async fn get_details(&self) -> EndpointResult<TargetDetails> {
        self.check_reachable()?;
        Ok(self.state.lock().details.clone())
    }

    async fn create_new_vm(
        &self,
        instance: &Instance,
        definition: &VmDefinition,
        placement: &Placement,
        boot_iso: Option<&str>,
    ) -> EndpointResult<()> {
        self.check_reachable()?;
        let pool = placement.root_pool().unwrap_or("default").to_string();
        let delay = {
            let mut state = self.state.lock();
            state.create_calls += 1;
            state.active_creates += 1;
            state.max_concurrent_creates = state.max_concurrent_creates.max(state.active_creates);
            state.create_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.active_creates -= 1;
        if state.vms.contains_key(&definition.name) {
            return Err(EndpointError::AlreadyExists {
                item: definition.name.clone(),
            });
        }
        state.vms.insert(definition.name.clone(), definition.clone());
        state
            .boot_isos
            .insert(definition.name.clone(), boot_iso.map(str::to_string));
        state.add_volume(&pool, &instance.worker_volume_name());
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> EndpointResult<()> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if !state.vms.contains_key(name) {
            return Err(EndpointError::not_found(format!("instance {}", name)));
        }
        if state.fail_start.contains(name) {
            return Err(EndpointError::operation("start", format!("{} failed to boot", name)));
        }
        state.started.insert(name.to_string());
        Ok(())
    }

    async fn check_agent(&self, name: &str) -> EndpointResult<()> {
        let state = self.state.lock();
        if state.started.contains(name) && !state.silent_agents.contains(name) {
            Ok(())
        } else {
            Err(EndpointError::operation("agent", format!("agent of {} not ready", name)))
        }
    }

    async fn create_storage_pool_volume_from_backup(
        &self,
        pool: &str,
        volume: &str,
        _path: &Path,
    ) -> EndpointResult<Vec<Box<dyn TargetOperation>>> {
        self.check_reachable()?;
        Ok(vec![self.start_import(pool, volume)])
    }

    async fn create_storage_pool_volume_from_iso(
        &self,
        pool: &str,
        volume: &str,
        _path: &Path,
    ) -> EndpointResult<Box<dyn TargetOperation>> {
        self.check_reachable()?;
        Ok(self.start_import(pool, volume))
    }

    async fn get_storage_pool_volume_names(&self, pool: &str) -> EndpointResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .volumes
            .get(pool)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_vm(&self, name: &str) -> EndpointResult<()> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if state.vms.remove(name).is_none() {
            return Err(EndpointError::not_found(format!("instance {}", name)));
        }
        state.started.remove(name);
        state.deleted.push(name.to_string());
        let worker_volume = format!("{}-worker", name);
        for names in state.volumes.values_mut() {
            names.remove(&worker_volume);
        }
        Ok(())
    }

    async fn set_post_migration_vm_config(
        &self,
        instance: &Instance,
        config: &PostMigrationConfig,
    ) -> EndpointResult<()> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if !state.vms.contains_key(instance.name()) {
            return Err(EndpointError::not_found(format!("instance {}", instance.name())));
        }
        state
            .post_migration
            .insert(instance.name().to_string(), config.clone());
        Ok(())
    }
}

/// Import that completes after a fixed delay.
struct FakeOperation {
    id: String,
    pool: String,
    volume: String,
    delay: Duration,
    state: Arc<Mutex<TargetState>>,
    done: bool,
}

#[async_trait]
impl TargetOperation for FakeOperation {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> EndpointResult<()> {
        if self.done {
            return Ok(());
        }
        tokio::time::sleep(self.delay).await;
        let mut state = self.state.lock();
        state.active_imports -= 1;
        state.add_volume(&self.pool, &self.volume);
        self.done = true;
        Ok(())
    }
}

impl Drop for FakeOperation {
    fn drop(&mut self) {
        // An abandoned operation no longer counts as running.
        if !self.done {
            self.state.lock().active_imports -= 1;
        }
    }
}

/// Inventory and recorded calls of a fake source.
#[derive(Debug, Default)]
pub struct SourceState {
    pub vms: Vec<Instance>,
    pub networks: Vec<Network>,
    /// Locations passed to `power_on_vm`.
    pub powered_on: Vec<String>,
    pub unreachable: bool,
}

pub struct FakeSource {
    name: String,
    state: Arc<Mutex<SourceState>>,
}

impl FakeSource {
    pub fn new(name: impl Into<String>, state: Arc<Mutex<SourceState>>) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }

    fn check_reachable(&self) -> EndpointResult<()> {
        if self.state.lock().unreachable {
            return Err(EndpointError::connection(&self.name, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceEndpoint for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> EndpointResult<()> {
        self.check_reachable()
    }

    async fn get_all_networks(&self) -> EndpointResult<Vec<Network>> {
        self.check_reachable()?;
        Ok(self.state.lock().networks.clone())
    }

    async fn get_all_vms(&self) -> EndpointResult<Vec<Instance>> {
        self.check_reachable()?;
        Ok(self.state.lock().vms.clone())
    }

    async fn power_on_vm(&self, location: &str) -> EndpointResult<()> {
        self.check_reachable()?;
        self.state.lock().powered_on.push(location.to_string());
        Ok(())
    }
}

/// Hands out fake endpoints by catalog name.
#[derive(Default)]
pub struct FakeFactory {
    sources: Mutex<HashMap<String, Arc<Mutex<SourceState>>>>,
    targets: Mutex<HashMap<String, Arc<Mutex<TargetState>>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers source `name`, returning its shared state.
    pub fn add_source(&self, name: &str) -> Arc<Mutex<SourceState>> {
        let state = Arc::new(Mutex::new(SourceState::default()));
        self.sources.lock().insert(name.to_string(), Arc::clone(&state));
        state
    }

    /// Registers target `name` with the given capabilities, returning its
    /// shared state.
    pub fn add_target(&self, name: &str, details: TargetDetails) -> Arc<Mutex<TargetState>> {
        let state = Arc::new(Mutex::new(TargetState::new(details)));
        self.targets.lock().insert(name.to_string(), Arc::clone(&state));
        state
    }
}

impl EndpointFactory for FakeFactory {
    fn source(&self, source: &Source) -> EndpointResult<Arc<dyn SourceEndpoint>> {
        let state = self
            .sources
            .lock()
            .get(&source.name)
            .cloned()
            .ok_or_else(|| EndpointError::not_found(format!("source {}", source.name)))?;
        Ok(Arc::new(FakeSource::new(&source.name, state)))
    }

    fn target(&self, target: &Target) -> EndpointResult<Arc<dyn TargetEndpoint>> {
        let state = self
            .targets
            .lock()
            .get(&target.name)
            .cloned()
            .ok_or_else(|| EndpointError::not_found(format!("target {}", target.name)))?;
        Ok(Arc::new(FakeTarget::new(&target.name, state)))
    }
}
