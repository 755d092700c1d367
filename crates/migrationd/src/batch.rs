//! Batch lifecycle.
//!
//! ```text
//! DEFINED --start--> QUEUED --queue pass--> RUNNING --> FINISHED
//!    ^                  |                     |  \
//!    |                  +------> ERROR <------+   +--stop--> STOPPED
//!    +----------------------- reset (from any state)
//! ```
//!
//! Membership is only ever changed while a batch is DEFINED; once started,
//! the set of instances is fixed until the batch is reset.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::Context;
use crate::error::{MigrationError, MigrationResult, StoreResult};
use crate::expr::Expr;
use crate::placement::PlacementResolver;
use crate::store::Tx;
use chrono::Utc;
use migration_types::{Batch, BatchStatus, MigrationStatus, QueueEntry};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct BatchManager {
    ctx: Context,
}

impl BatchManager {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Stores a new batch in DEFINED and assigns matching instances to it.
    pub fn create_batch(&self, mut batch: Batch) -> MigrationResult<()> {
        validate_definition(&batch)?;
        batch.status = BatchStatus::Defined;
        batch.status_message.clear();

        let (assigned, _) = self.ctx.store.transaction(|tx| {
            tx.create_batch(&batch)?;
            refresh_membership(tx)
        })?;

        info!(batch = %batch.name, assigned, "Created batch");
        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "create")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&batch.name)
            .with_object_type("batch")
            .with_details(serde_json::json!({
                "include_expression": batch.include_expression,
                "assigned": assigned,
            })));
        Ok(())
    }

    /// Replaces the definition of a DEFINED batch.
    pub fn update_batch(&self, mut batch: Batch) -> MigrationResult<()> {
        validate_definition(&batch)?;

        self.ctx.store.transaction(|tx| {
            let stored = tx.require_batch(&batch.name)?;
            if stored.status != BatchStatus::Defined {
                return Err(invalid_state(&stored, "only defined batches can be modified"));
            }
            batch.status = stored.status;
            batch.status_message = stored.status_message;
            tx.update_batch(&batch)?;
            refresh_membership(tx)?;
            Ok::<_, MigrationError>(())
        })?;

        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "update")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&batch.name)
            .with_object_type("batch"));
        Ok(())
    }

    /// Deletes a DEFINED batch, releasing its instances.
    pub fn delete_batch(&self, name: &str) -> MigrationResult<()> {
        self.ctx.store.transaction(|tx| {
            let batch = tx.require_batch(name)?;
            if batch.status != BatchStatus::Defined {
                return Err(invalid_state(&batch, "reset the batch before deleting it"));
            }

            for mut instance in tx.get_instances_by_batch(name)? {
                instance.batch = None;
                instance.migration_status = MigrationStatus::NotAssignedBatch;
                instance.migration_status_message.clear();
                tx.update_instance(&instance)?;
            }
            tx.delete_batch(name)?;
            Ok::<_, MigrationError>(())
        })?;

        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "delete")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(name)
            .with_object_type("batch"));
        Ok(())
    }

    /// Re-evaluates the membership of every DEFINED batch.
    pub fn refresh_membership(&self) -> MigrationResult<(usize, usize)> {
        Ok(self.ctx.store.transaction(refresh_membership)?)
    }

    /// Validates a batch and moves it to QUEUED.
    ///
    /// The migration windows must not all have ended, the batch must have
    /// members, and the worker endpoint must be a reachable, non-wildcard
    /// address. A failed check puts the batch in ERROR with the reason.
    pub async fn start_batch(&self, name: &str) -> MigrationResult<()> {
        let (batch, members) = self.ctx.store.transaction(|tx| {
            Ok::<_, MigrationError>((tx.require_batch(name)?, tx.count_instances_by_batch(name)?))
        })?;

        if !matches!(
            batch.status,
            BatchStatus::Defined | BatchStatus::Stopped | BatchStatus::Error
        ) {
            return Err(invalid_state(&batch, "batch is already started"));
        }

        let check = if !batch.windows_valid(Utc::now()) {
            Err("All migration windows have ended".to_string())
        } else if members == 0 {
            Err("Batch has no instances".to_string())
        } else {
            check_worker_endpoint(&self.ctx.config.worker_endpoint, self.ctx.config.connect_timeout())
                .await
        };

        if let Err(message) = check {
            self.ctx
                .store
                .transaction(|tx| tx.set_batch_status(name, BatchStatus::Error, &message))?;
            warn!(batch = %name, error = %message, "Failed to start batch");
            audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "start")
                .with_object_id(name)
                .with_object_type("batch")
                .with_error(&message));
            return Err(MigrationError::Validation(message));
        }

        self.ctx
            .store
            .transaction(|tx| tx.set_batch_status(name, BatchStatus::Queued, ""))?;

        info!(batch = %name, members, "Queued batch");
        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "start")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(name)
            .with_object_type("batch"));
        Ok(())
    }

    /// Stops a QUEUED or RUNNING batch.
    ///
    /// Holds the provisioning lock, so no provisioning pass is between
    /// claiming instances and starting work on them while the batch stops.
    pub async fn stop_batch(&self, name: &str) -> MigrationResult<()> {
        let _guard = self.ctx.provision_lock.lock().await;

        self.ctx.store.transaction(|tx| {
            let batch = tx.require_batch(name)?;
            if !matches!(batch.status, BatchStatus::Queued | BatchStatus::Running) {
                return Err(invalid_state(&batch, "batch is not running"));
            }
            tx.set_batch_status(name, BatchStatus::Stopped, "")?;
            Ok::<_, MigrationError>(())
        })?;

        info!(batch = %name, "Stopped batch");
        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "stop")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(name)
            .with_object_type("batch"));
        Ok(())
    }

    /// Returns a batch to DEFINED.
    ///
    /// Target VMs are deleted where their worker volume shows that creation
    /// got at least part of the way; failures are logged and do not stop the
    /// cleanup of other instances. Then all queue entries are dropped and the
    /// instances go back to ASSIGNED_BATCH.
    pub async fn reset_batch(&self, name: &str) -> MigrationResult<()> {
        let _guard = self.ctx.provision_lock.lock().await;

        let entries = self
            .ctx
            .store
            .transaction(|tx| {
                tx.require_batch(name)?;
                tx.get_queue_entries_by_batch(name)
            })?;

        let mut deleted = 0;
        for entry in &entries {
            match self.cleanup_entry(entry).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(batch = %name, instance = %entry.instance_uuid, error = %e,
                        "Failed to clean up target VM");
                }
            }
        }

        self.ctx.store.transaction(|tx| {
            tx.delete_queue_entries_by_batch(name)?;
            for mut instance in tx.get_instances_by_batch(name)? {
                instance.migration_status = MigrationStatus::AssignedBatch;
                instance.migration_status_message.clear();
                tx.update_instance(&instance)?;
            }
            tx.set_batch_status(name, BatchStatus::Defined, "")?;
            refresh_membership(tx)
        })?;

        info!(batch = %name, entries = entries.len(), deleted, "Reset batch");
        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "reset")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(name)
            .with_object_type("batch")
            .with_details(serde_json::json!({
                "entries": entries.len(),
                "deleted_vms": deleted,
            })));
        Ok(())
    }

    /// Deletes the target VM of `entry` if its worker volume exists.
    async fn cleanup_entry(&self, entry: &QueueEntry) -> MigrationResult<bool> {
        let placement = &entry.placement;
        let Some(pool) = placement.root_pool() else {
            return Ok(false);
        };

        let (instance, target) = self.ctx.store.transaction(|tx| {
            Ok::<_, MigrationError>((
                tx.require_instance(entry.instance_uuid)?,
                tx.require_target(&placement.target)?,
            ))
        })?;

        let endpoint = self.ctx.endpoints.target(&target)?;
        endpoint.connect().await?;
        endpoint.set_project(&placement.target_project).await?;

        let volumes = endpoint.get_storage_pool_volume_names(pool).await?;
        if !volumes.contains(&instance.worker_volume_name()) {
            debug!(instance = %instance.uuid, "No worker volume, nothing to delete");
            return Ok(false);
        }

        endpoint.delete_vm(instance.name()).await?;
        info!(instance = %instance.uuid, name = %instance.name(), "Deleted target VM");
        Ok(true)
    }
}

fn invalid_state(batch: &Batch, message: &str) -> MigrationError {
    MigrationError::InvalidState {
        name: batch.name.clone(),
        status: batch.status,
        message: message.to_string(),
    }
}

fn validate_definition(batch: &Batch) -> MigrationResult<()> {
    if batch.name.trim().is_empty() {
        return Err(MigrationError::Validation("Batch name must not be empty".to_string()));
    }

    Expr::parse(&batch.include_expression)?;
    for constraint in &batch.constraints {
        Expr::parse(&constraint.include_expression)?;
    }
    PlacementResolver::new(batch)?;

    if let Some(window) = batch.migration_windows.iter().find(|w| !w.is_well_formed()) {
        return Err(MigrationError::Validation(format!(
            "Migration window ends before it starts: {:?} - {:?}",
            window.start, window.end
        )));
    }

    Ok(())
}

/// Assigns unclaimed instances to the DEFINED batch whose expression they
/// match, and releases members of DEFINED batches that no longer match.
///
/// Returns the number of assigned and released instances.
pub(crate) fn refresh_membership(tx: &Tx<'_>) -> StoreResult<(usize, usize)> {
    let batches: Vec<(Batch, Expr)> = tx
        .get_batches_by_status(BatchStatus::Defined)?
        .into_iter()
        .filter_map(|batch| match Expr::parse(&batch.include_expression) {
            Ok(expr) => Some((batch, expr)),
            Err(e) => {
                warn!(batch = %batch.name, error = %e, "Skipping batch with invalid expression");
                None
            }
        })
        .collect();

    let mut assigned = 0;
    let mut released = 0;

    for mut instance in tx.get_instances()? {
        match instance.batch.as_deref() {
            Some(current) => {
                let Some((_, expr)) = batches.iter().find(|(b, _)| b.name == current) else {
                    continue;
                };
                if !expr.matches(&instance) {
                    instance.batch = None;
                    instance.migration_status = MigrationStatus::NotAssignedBatch;
                    instance.migration_status_message.clear();
                    tx.update_instance(&instance)?;
                    released += 1;
                }
            }
            None => {
                if let Some((batch, _)) = batches.iter().find(|(_, expr)| expr.matches(&instance)) {
                    instance.batch = Some(batch.name.clone());
                    instance.migration_status = MigrationStatus::AssignedBatch;
                    instance.migration_status_message.clear();
                    tx.update_instance(&instance)?;
                    assigned += 1;

                    audit_log!(AuditRecord::new(
                        AuditCategory::BatchMembership,
                        "BatchManager",
                        "assign"
                    )
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(instance.uuid.to_string())
                    .with_object_type("instance")
                    .with_batch(&batch.name));
                }
            }
        }
    }

    if assigned > 0 || released > 0 {
        debug!(assigned, released, "Refreshed batch membership");
    }
    Ok((assigned, released))
}

/// Checks that workers will be able to reach `endpoint`.
pub async fn check_worker_endpoint(endpoint: &str, timeout: Duration) -> Result<(), String> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| format!("Invalid worker endpoint {}: {}", endpoint, e))?;

    let host = url.host_str().unwrap_or_default();
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host == "0.0.0.0" || host == "::" {
        return Err(format!(
            "Worker endpoint {} must name a specific address, not a wildcard",
            endpoint
        ));
    }

    let port = url
        .port_or_known_default()
        .ok_or_else(|| format!("Worker endpoint {} has no port", endpoint))?;

    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("Worker endpoint {} is unreachable: {}", endpoint, e)),
        Err(_) => Err(format!("Timed out connecting to worker endpoint {}", endpoint)),
    }
}
