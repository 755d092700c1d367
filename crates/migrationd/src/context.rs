//! State shared by every engine component.

use crate::artifacts::ArtifactStore;
use crate::config::DaemonConfig;
use crate::error::MigrationResult;
use crate::store::Store;
use dashmap::DashMap;
use migration_endpoint::EndpointFactory;
use migration_orch_common::KeyedLock;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Key of the asset-import lock: target, storage pool, project.
pub type ImportKey = (String, String, String);

/// Handles shared by the batch manager and the periodic phases.
///
/// Cloning is cheap; clones share every lock.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<Store>,
    pub endpoints: Arc<dyn EndpointFactory>,
    pub artifacts: Arc<ArtifactStore>,
    pub config: Arc<DaemonConfig>,
    /// Separates stopping a batch from starting provisioning work.
    pub provision_lock: Arc<Mutex<()>>,
    /// Serializes asset imports into one target pool and project.
    pub import_locks: Arc<KeyedLock<ImportKey>>,
    /// VM creation slots per target, shared by all batches.
    create_limits: Arc<DashMap<String, (usize, Arc<Semaphore>)>>,
}

impl Context {
    pub fn new(
        store: Arc<Store>,
        endpoints: Arc<dyn EndpointFactory>,
        config: DaemonConfig,
    ) -> MigrationResult<Self> {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone())?;
        Ok(Self {
            store,
            endpoints,
            artifacts: Arc::new(artifacts),
            config: Arc::new(config),
            provision_lock: Arc::new(Mutex::new(())),
            import_locks: Arc::new(KeyedLock::new()),
            create_limits: Arc::new(DashMap::new()),
        })
    }

    /// Creation semaphore of `target` with `limit` slots.
    ///
    /// A changed limit replaces the semaphore; permits already handed out
    /// keep counting against the old one until released.
    pub fn create_slots(&self, target: &str, limit: usize) -> Arc<Semaphore> {
        let limit = limit.max(1);
        let mut slot = self
            .create_limits
            .entry(target.to_string())
            .or_insert_with(|| (limit, Arc::new(Semaphore::new(limit))));
        if slot.0 != limit {
            *slot = (limit, Arc::new(Semaphore::new(limit)));
        }
        Arc::clone(&slot.1)
    }
}
