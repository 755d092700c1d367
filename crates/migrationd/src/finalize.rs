//! Post-migration finalization.
//!
//! Once a worker reports its final sync done the instance is
//! IMPORT_COMPLETE. The finalizer then rewires the target VM for normal
//! operation (NIC placeholders to the resolved networks, migration devices
//! removed, OS fixups) and marks it FINISHED.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::Context;
use crate::error::{endpoint_task_error, EndpointResultExt};
use migration_endpoint::PostMigrationConfig;
use migration_orch_common::{TaskError, TaskResult};
use migration_types::{Batch, BatchStatus, MigrationStatus, QueueEntry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Finalizer {
    ctx: Context,
}

impl Finalizer {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Finalizes IMPORT_COMPLETE instances, then completes batches whose
    /// instances have all reached a terminal state.
    pub async fn run_once(&self, cancel: &CancellationToken) -> TaskResult<()> {
        let batches = self
            .ctx
            .store
            .transaction(|tx| tx.get_batches_by_status(BatchStatus::Running))?;

        for batch in &batches {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let entries = self.ctx.store.transaction(|tx| {
                tx.get_queue_entries_by_batch_and_status(&batch.name, MigrationStatus::ImportComplete)
            })?;

            futures::future::join_all(entries.iter().map(|entry| self.finalize_entry(batch, entry, cancel))).await;
        }

        self.complete_batches()?;
        Ok(())
    }

    /// Finalizes one instance, recording the outcome on its entry.
    async fn finalize_entry(&self, batch: &Batch, entry: &QueueEntry, cancel: &CancellationToken) {
        let result = tokio::select! {
            result = self.apply_config(entry) => result,
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
        };

        let uuid = entry.instance_uuid;
        let (status, message) = match result {
            Ok(()) => (MigrationStatus::Finished, "Migration finished".to_string()),
            Err(e) if e.to_status().is_retryable() => {
                debug!(instance = %uuid, error = %e, "Finalization deferred");
                return;
            }
            Err(e) => (MigrationStatus::Error, e.to_string()),
        };

        if let Err(e) = self
            .ctx
            .store
            .transaction(|tx| tx.set_migration_status(uuid, status, &message))
        {
            warn!(instance = %uuid, error = %e, "Failed to record finalization result");
            return;
        }

        let record = AuditRecord::new(AuditCategory::Finalization, "Finalizer", "finalize")
            .with_object_id(uuid.to_string())
            .with_object_type("instance")
            .with_batch(&batch.name);
        if status == MigrationStatus::Finished {
            info!(instance = %uuid, batch = %batch.name, "Migration finished");
            audit_log!(record.with_outcome(AuditOutcome::Success));
        } else {
            warn!(instance = %uuid, batch = %batch.name, error = %message, "Finalization failed");
            audit_log!(record.with_error(message));
        }
    }

    async fn apply_config(&self, entry: &QueueEntry) -> TaskResult<()> {
        let placement = &entry.placement;
        let (instance, target) = self.ctx.store.transaction(|tx| {
            Ok::<_, TaskError>((
                tx.require_instance(entry.instance_uuid)?,
                tx.require_target(&placement.target)?,
            ))
        })?;

        let endpoint = self.ctx.endpoints.target(&target).map_err(endpoint_task_error)?;
        endpoint
            .connect()
            .await
            .task_context("Failed to connect to target")?;
        endpoint
            .set_project(&placement.target_project)
            .await
            .task_context("Failed to select project")?;

        let config = PostMigrationConfig::build(&instance, placement);
        endpoint
            .set_post_migration_vm_config(&instance, &config)
            .await
            .task_context("Failed to apply post-migration configuration")
    }

    /// Moves RUNNING batches whose entries are all FINISHED or ERROR to
    /// FINISHED.
    pub fn complete_batches(&self) -> TaskResult<Vec<String>> {
        let completed = self.ctx.store.transaction(|tx| {
            let mut completed = Vec::new();
            for batch in tx.get_batches_by_status(BatchStatus::Running)? {
                let entries = tx.get_queue_entries_by_batch(&batch.name)?;
                if entries.is_empty() || !entries.iter().all(|e| e.migration_status.is_terminal()) {
                    continue;
                }

                let failed = entries
                    .iter()
                    .filter(|e| e.migration_status == MigrationStatus::Error)
                    .count();
                let message = if failed == 0 {
                    String::new()
                } else {
                    format!("{} of {} instances failed", failed, entries.len())
                };
                tx.set_batch_status(&batch.name, BatchStatus::Finished, &message)?;
                completed.push(batch.name);
            }
            Ok::<_, TaskError>(completed)
        })?;

        for name in &completed {
            info!(batch = %name, "Batch finished");
            audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "Finalizer", "complete")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(name)
                .with_object_type("batch"));
        }

        Ok(completed)
    }
}
