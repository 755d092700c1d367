//! Target VM provisioning.
//!
//! Each pass works through the RUNNING batches independently. For a batch
//! it checks the batch-wide prerequisites, claims WAITING entries (moving
//! them to CREATING under the provisioning lock, honouring batch
//! constraints), and then provisions every CREATING entry concurrently,
//! bounded per target by its creation limit. The limit covers the target as
//! a whole: batches share its slots.
//!
//! Per instance:
//!
//! 1. connect to the target and select the project
//! 2. resolve OS dependencies (driver ISO for Windows, OS image for appliances)
//!    and open every artifact file needed, fetching any known only by URL
//! 3. import missing shared volumes under the (target, pool, project) lock
//! 4. build the definition and create the VM unless its worker volume
//!    already exists; in cleanup mode a delete is armed from here on
//! 5. start the VM and wait for its agent
//! 6. mark the instance IDLE, which disarms the delete
//!
//! A pass only returns after all instance tasks have finished, so a
//! CREATING entry seen at the start of a pass is not being worked on by
//! anyone and is picked up again.

use crate::artifacts::ArtifactFile;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::Context;
use crate::error::{endpoint_task_error, EndpointResultExt};
use crate::expr::Expr;
use chrono::Utc;
use migration_endpoint::{DefinitionRequest, TargetEndpoint, TargetOperation};
use migration_orch_common::{Reverter, TaskError, TaskResult, TaskStatus};
use migration_types::{
    Artifact, Batch, BatchStatus, Instance, MigrationStatus, OsType, QueueEntry, SourceType,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Volume holding the worker image, imported once per pool and project.
pub const WORKER_IMAGE_VOLUME: &str = "migration-worker-image";

pub struct Provisioner {
    ctx: Context,
}

impl Provisioner {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Runs one provisioning pass over all RUNNING batches.
    pub async fn run_once(&self, cancel: &CancellationToken) -> TaskResult<()> {
        let batches = self
            .ctx
            .store
            .transaction(|tx| tx.get_batches_by_status(BatchStatus::Running))?;

        let results = futures::future::join_all(
            batches
                .into_iter()
                .map(|batch| self.provision_batch(batch, cancel)),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Provisioning pass for batch failed");
            }
        }
        Ok(())
    }

    /// Provisions the pending entries of one batch; returns how many were
    /// worked on.
    pub async fn provision_batch(&self, batch: Batch, cancel: &CancellationToken) -> TaskResult<usize> {
        let pending = self.ctx.store.transaction(|tx| {
            let mut pending = tx.get_queue_entries_by_batch_and_status(&batch.name, MigrationStatus::Waiting)?;
            pending.extend(
                tx.get_queue_entries_by_batch_and_status(&batch.name, MigrationStatus::Creating)?,
            );
            Ok::<_, TaskError>(pending)
        })?;
        if pending.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.check_prerequisites(&batch, &pending).await {
            if e.to_status() == TaskStatus::BatchFailed {
                self.fail_batch(&batch, &e)?;
                return Ok(0);
            }
            return Err(e);
        }

        let work = self.claim(&batch).await?;
        if work.is_empty() {
            return Ok(0);
        }

        let batch = Arc::new(batch);
        let mut limits: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for (entry, instance) in work {
            let semaphore = match limits.get(&entry.placement.target) {
                Some(semaphore) => Arc::clone(semaphore),
                None => {
                    let limit = self
                        .ctx
                        .store
                        .transaction(|tx| tx.get_target(&entry.placement.target))?
                        .and_then(|target| target.create_limit)
                        .unwrap_or(self.ctx.config.default_create_limit);
                    let semaphore = self.ctx.create_slots(&entry.placement.target, limit);
                    limits.insert(entry.placement.target.clone(), Arc::clone(&semaphore));
                    semaphore
                }
            };

            let ctx = self.ctx.clone();
            let batch = Arc::clone(&batch);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let Some(_permit) = permit else {
                    record_failure(&ctx, &batch, &instance, TaskError::Cancelled);
                    return;
                };
                provision_instance(ctx, batch, entry, instance, cancel).await;
            });
        }

        let count = tasks.len();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(batch = %batch.name, error = %e, "Provisioning task panicked");
            }
        }

        debug!(batch = %batch.name, count, "Provisioning pass finished");
        Ok(count)
    }

    /// Batch-wide requirements: an open or future migration window, the
    /// worker image, and an SDK artifact for every source type needing one.
    async fn check_prerequisites(&self, batch: &Batch, pending: &[QueueEntry]) -> TaskResult<()> {
        if !batch.windows_valid(Utc::now()) {
            return Err(TaskError::batch_structural("All migration windows have ended"));
        }

        let (worker, sdks) = self.ctx.store.transaction(|tx| {
            let worker = tx.find_worker_artifact()?;
            let mut source_types: HashSet<SourceType> = HashSet::new();
            for entry in pending {
                let instance = tx.require_instance(entry.instance_uuid)?;
                if instance.source_type.requires_sdk() {
                    source_types.insert(instance.source_type);
                }
            }

            let mut sdks = Vec::new();
            for source_type in source_types {
                sdks.push((source_type, tx.find_sdk_artifact(source_type)?));
            }
            Ok::<_, TaskError>((worker, sdks))
        })?;

        let worker = worker.ok_or_else(|| TaskError::batch_structural("No worker image artifact available"))?;
        if !self.ctx.artifacts.is_available(&worker).await {
            return Err(TaskError::batch_structural("Worker image artifact has no file"));
        }

        for (source_type, sdk) in sdks {
            let sdk = sdk.ok_or_else(|| {
                TaskError::batch_structural(format!("No SDK artifact available for {} sources", source_type))
            })?;
            if !self.ctx.artifacts.is_available(&sdk).await {
                return Err(TaskError::batch_structural(format!(
                    "SDK artifact for {} sources has no file",
                    source_type
                )));
            }
        }

        Ok(())
    }

    fn fail_batch(&self, batch: &Batch, e: &TaskError) -> TaskResult<()> {
        let message = e.to_string();
        self.ctx
            .store
            .transaction(|tx| tx.set_batch_status(&batch.name, BatchStatus::Error, &message))?;

        error!(batch = %batch.name, error = %message, "Batch prerequisites not met");
        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "Provisioner", "check_prerequisites")
            .with_object_id(&batch.name)
            .with_object_type("batch")
            .with_error(message));
        Ok(())
    }

    /// Moves WAITING entries to CREATING and returns every CREATING entry.
    ///
    /// Runs under the provisioning lock and re-reads the batch inside it, so
    /// a batch stopped meanwhile is left alone.
    async fn claim(&self, batch: &Batch) -> TaskResult<Vec<(QueueEntry, Instance)>> {
        let constraints: Vec<(Expr, usize)> = batch
            .constraints
            .iter()
            .filter_map(|c| {
                let limit = c.max_concurrent_instances?;
                match Expr::parse(&c.include_expression) {
                    Ok(expr) => Some((expr, limit)),
                    Err(e) => {
                        warn!(batch = %batch.name, constraint = %c.name, error = %e,
                            "Ignoring constraint with invalid expression");
                        None
                    }
                }
            })
            .collect();

        let _guard = self.ctx.provision_lock.lock().await;

        self.ctx.store.transaction(|tx| {
            let current = tx.require_batch(&batch.name)?;
            if current.status != BatchStatus::Running {
                return Ok(Vec::new());
            }

            let entries = tx.get_queue_entries_by_batch(&batch.name)?;
            let mut in_flight = vec![0usize; constraints.len()];
            let mut instances = HashMap::new();
            for entry in &entries {
                let instance = tx.require_instance(entry.instance_uuid)?;
                if entry.migration_status.is_in_flight() {
                    for (index, (expr, _)) in constraints.iter().enumerate() {
                        if expr.matches(&instance) {
                            in_flight[index] += 1;
                        }
                    }
                }
                instances.insert(entry.instance_uuid, instance);
            }

            let mut work = Vec::new();
            for mut entry in entries {
                let Some(instance) = instances.remove(&entry.instance_uuid) else {
                    continue;
                };

                match entry.migration_status {
                    MigrationStatus::Creating => work.push((entry, instance)),
                    MigrationStatus::Waiting => {
                        let matching: Vec<usize> = constraints
                            .iter()
                            .enumerate()
                            .filter(|(_, (expr, _))| expr.matches(&instance))
                            .map(|(index, _)| index)
                            .collect();
                        if matching
                            .iter()
                            .any(|&index| in_flight[index] >= constraints[index].1)
                        {
                            debug!(instance = %instance.uuid, "Constraint limit reached, staying queued");
                            continue;
                        }
                        for index in matching {
                            in_flight[index] += 1;
                        }

                        entry.migration_status = MigrationStatus::Creating;
                        entry.migration_status_message = "Creating target VM".to_string();
                        tx.update_queue_entry(&entry)?;
                        work.push((entry, instance));
                    }
                    _ => {}
                }
            }

            Ok::<_, TaskError>(work)
        })
    }
}

/// Provisions one instance and records the outcome.
async fn provision_instance(
    ctx: Context,
    batch: Arc<Batch>,
    entry: QueueEntry,
    instance: Instance,
    cancel: CancellationToken,
) {
    let mut reverter = Reverter::new();
    let result = run_pipeline(&ctx, &batch, &entry, &instance, &mut reverter, &cancel).await;

    match result {
        Ok(()) => {
            reverter.success();
            info!(batch = %batch.name, instance = %instance.uuid, name = %instance.name(),
                "Target VM started, handed off to worker");
            audit_log!(AuditRecord::new(AuditCategory::Provisioning, "Provisioner", "create_vm")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(instance.uuid.to_string())
                .with_object_type("instance")
                .with_batch(&batch.name));
        }
        Err(err) => {
            reverter.fail().await;
            record_failure(&ctx, &batch, &instance, err);
        }
    }
}

fn record_failure(ctx: &Context, batch: &Batch, instance: &Instance, err: TaskError) {
    let message = err.to_string();
    // With cleanup on, the VM is gone again and the instance can retry.
    let status = match err.to_status() {
        TaskStatus::Blocked => MigrationStatus::Blocked,
        status if status.is_failure() && !batch.config.cleanup_on_failure => MigrationStatus::Error,
        _ => MigrationStatus::Waiting,
    };

    warn!(batch = %batch.name, instance = %instance.uuid, status = %status, error = %message,
        "Failed to provision target VM");
    audit_log!(AuditRecord::new(AuditCategory::Provisioning, "Provisioner", "create_vm")
        .with_object_id(instance.uuid.to_string())
        .with_object_type("instance")
        .with_batch(&batch.name)
        .with_details(serde_json::json!({ "status": status.as_str() }))
        .with_error(&message));

    let recorded = ctx.store.transaction(|tx| {
        // The entry is gone if the batch was reset meanwhile.
        match tx.get_queue_entry(instance.uuid)? {
            Some(entry) if entry.migration_status == MigrationStatus::Creating => {
                tx.set_migration_status(instance.uuid, status, &message).map(|_| ())
            }
            _ => Ok(()),
        }
    });
    if let Err(e) = recorded {
        error!(instance = %instance.uuid, error = %e, "Failed to record provisioning failure");
    }
}

async fn run_pipeline(
    ctx: &Context,
    batch: &Batch,
    entry: &QueueEntry,
    instance: &Instance,
    reverter: &mut Reverter,
    cancel: &CancellationToken,
) -> TaskResult<()> {
    let placement = &entry.placement;
    let name = instance.name().to_string();

    let (target, worker, driver_iso, os_image) = ctx.store.transaction(|tx| {
        let target = tx.require_target(&placement.target)?;
        let worker = tx
            .find_worker_artifact()?
            .ok_or_else(|| TaskError::batch_structural("No worker image artifact available"))?;

        let driver_iso = match instance.properties.os_type {
            OsType::Windows => Some(tx.find_driver_iso(instance)?.ok_or_else(|| {
                TaskError::validation(format!(
                    "No driver ISO artifact for {} on {}",
                    instance.properties.os, instance.properties.architecture
                ))
            })?),
            _ => None,
        };

        let os_image = match instance.properties.os_type {
            OsType::Appliance => Some(tx.find_os_image(instance)?.ok_or_else(|| {
                TaskError::validation(format!(
                    "No OS image artifact for {} {} on {}",
                    instance.properties.os,
                    instance.properties.os_version,
                    instance.properties.architecture
                ))
            })?),
            _ => None,
        };

        Ok::<_, TaskError>((target, worker, driver_iso, os_image))
    })?;

    let endpoint = ctx.endpoints.target(&target).map_err(endpoint_task_error)?;
    endpoint
        .connect()
        .await
        .task_context("Failed to connect to target")?;
    endpoint
        .set_project(&placement.target_project)
        .await
        .task_context("Failed to select project")?;

    let pool = placement
        .root_pool()
        .unwrap_or(&batch.defaults.storage_pool)
        .to_string();

    // Worker image first, then the OS dependencies; one guard covers all.
    let files = {
        let needed: Vec<&Artifact> = std::iter::once(&worker)
            .chain(driver_iso.as_ref())
            .chain(os_image.as_ref())
            .collect();
        tokio::select! {
            files = ctx.artifacts.open_all(&needed) => files
                .map_err(|e| e.into_task_error().context("Failed to open artifacts"))?,
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        }
    };
    let mut files = files.into_iter();
    let worker_file = files.next();
    let driver_iso = driver_iso.and_then(|_| files.next());
    let os_image = os_image.and_then(|_| files.next());

    let volumes = {
        let key = (target.name.clone(), pool.clone(), placement.target_project.clone());
        let _guard = tokio::select! {
            guard = ctx.import_locks.lock(key) => guard,
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        };

        let volumes = endpoint
            .get_storage_pool_volume_names(&pool)
            .await
            .task_context("Failed to list storage volumes")?;

        if !volumes.iter().any(|v| v == WORKER_IMAGE_VOLUME) {
            let file = worker_file
                .as_ref()
                .ok_or_else(|| TaskError::internal("Worker image file missing"))?;
            info!(pool = %pool, "Importing worker image");
            let operations = endpoint
                .create_storage_pool_volume_from_backup(&pool, WORKER_IMAGE_VOLUME, file.path())
                .await
                .task_context("Failed to import worker image")?;
            for operation in operations {
                wait_operation(operation, cancel).await?;
            }
        }

        for file in driver_iso.iter().chain(os_image.iter()) {
            let volume = file.name();
            if volumes.contains(&volume) {
                continue;
            }
            info!(pool = %pool, volume = %volume, "Importing ISO volume");
            let operation = endpoint
                .create_storage_pool_volume_from_iso(&pool, &volume, file.path())
                .await
                .task_context("Failed to import ISO")?;
            wait_operation(operation, cancel).await?;
        }

        volumes
    };

    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    let driver_iso_name = driver_iso.as_ref().map(ArtifactFile::name);
    let boot_iso = os_image.as_ref().map(ArtifactFile::name);
    let definition = endpoint.create_vm_definition(&DefinitionRequest {
        instance,
        placement,
        entry,
        server_fingerprint: &ctx.config.server_fingerprint,
        worker_endpoint: &ctx.config.worker_endpoint,
        driver_iso: driver_iso_name.as_deref(),
    });

    if volumes.contains(&instance.worker_volume_name()) {
        info!(instance = %instance.uuid, name = %name, "Worker volume exists, reusing VM from earlier attempt");
    } else {
        endpoint
            .create_new_vm(instance, &definition, placement, boot_iso.as_deref())
            .await
            .task_context("Failed to create VM")?;
    }

    if batch.config.cleanup_on_failure {
        let endpoint = Arc::clone(&endpoint);
        let vm = name.clone();
        reverter.add(format!("delete VM {}", name), move || async move {
            if let Err(e) = endpoint.delete_vm(&vm).await {
                warn!(name = %vm, error = %e, "Failed to delete VM during cleanup");
            }
        });
    }

    endpoint
        .start_vm(&name)
        .await
        .task_context("Failed to start VM")?;
    wait_for_agent(ctx, endpoint.as_ref(), &name, cancel).await?;

    ctx.store.transaction(|tx| {
        let mut entry = tx.require_queue_entry(instance.uuid)?;
        entry.migration_status = MigrationStatus::Idle;
        entry.migration_status_message = "Waiting for worker".to_string();
        entry.last_worker_update = Some(Utc::now());
        tx.update_queue_entry(&entry)
    })?;

    Ok(())
}

async fn wait_operation(mut operation: Box<dyn TargetOperation>, cancel: &CancellationToken) -> TaskResult<()> {
    let id = operation.id().to_string();
    tokio::select! {
        result = operation.wait() => result.task_context(&format!("Operation {} failed", id)),
        _ = cancel.cancelled() => Err(TaskError::Cancelled),
    }
}

/// Polls the in-guest agent until it answers or the agent timeout passes.
async fn wait_for_agent(
    ctx: &Context,
    endpoint: &dyn TargetEndpoint,
    name: &str,
    cancel: &CancellationToken,
) -> TaskResult<()> {
    let deadline = tokio::time::Instant::now() + ctx.config.agent_timeout();
    loop {
        let last_error = match endpoint.check_agent(name).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if tokio::time::Instant::now() >= deadline {
            return Err(TaskError::execution(format!(
                "Timed out waiting for agent of {}: {}",
                name, last_error
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.config.agent_poll_interval()) => {}
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        }
    }
}
