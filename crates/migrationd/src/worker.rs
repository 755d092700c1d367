//! Worker command/response protocol.
//!
//! Every queue entry carries a secret token that the in-guest worker
//! presents with each request. A worker polls [`WorkerHandler::get_command`]
//! for its next step and reports progress through
//! [`WorkerHandler::apply_response`]:
//!
//! ```text
//! stage        status             command
//! background   never synced       InitialSync
//! background   interval elapsed   BackgroundSync
//! final        under sync limit   FinalSync
//! complete     -                  Shutdown
//! ```
//!
//! Both calls count as a sign of life; [`WorkerHandler::check_liveness`]
//! errors instances whose worker went quiet.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::context::Context;
use crate::error::{MigrationError, MigrationResult};
use crate::store::Tx;
use crate::{audit_log, security_audit};
use chrono::{DateTime, Utc};
use migration_endpoint::EndpointResult;
use migration_orch_common::{TaskError, TaskResult};
use migration_types::{
    Batch, BatchStatus, ImportStage, Instance, MigrationStatus, QueueEntry, Source, WorkerCommand,
    WorkerCommandType, WorkerResponse, WorkerResponseStatus,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct WorkerHandler {
    ctx: Context,
}

impl WorkerHandler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Returns the next command for the worker of instance `uuid`.
    pub fn get_command(&self, uuid: Uuid, token: Uuid) -> MigrationResult<WorkerCommand> {
        let now = Utc::now();

        let (command, instance, source_blob) = self.ctx.store.transaction(|tx| {
            let (mut entry, instance, batch) = authenticate(tx, uuid, token)?;

            let command = next_command(tx, &mut entry, &batch, now)?;
            if entry.migration_status.is_worker_owned() {
                entry.last_worker_update = Some(now);
            }
            tx.update_queue_entry(&entry)?;

            let source_blob = tx
                .get_source(&instance.source)?
                .map(|source| source.properties)
                .unwrap_or(serde_json::Value::Null);
            Ok::<_, MigrationError>((command, instance, source_blob))
        })?;

        debug!(instance = %uuid, command = ?command, "Worker command");
        let properties = instance.properties;
        Ok(WorkerCommand {
            command,
            location: properties.location,
            source_type: instance.source_type,
            source: source_blob,
            os: properties.os,
            os_version: properties.os_version,
            os_type: properties.os_type,
            architecture: properties.architecture,
        })
    }

    /// Applies a status report from the worker of instance `uuid`.
    ///
    /// A failure report errors the instance and powers the source VM back
    /// on if it was running before the migration.
    pub async fn apply_response(&self, uuid: Uuid, token: Uuid, response: WorkerResponse) -> MigrationResult<()> {
        let now = Utc::now();

        let (entry, instance) = self.ctx.store.transaction(|tx| {
            let (mut entry, instance, _) = authenticate(tx, uuid, token)?;

            entry.last_worker_update = Some(now);
            entry.migration_status_message = response.status_message.clone();
            match response.status {
                WorkerResponseStatus::Running => {
                    entry.migration_status = match entry.import_stage {
                        ImportStage::Final => MigrationStatus::FinalImport,
                        _ => MigrationStatus::BackgroundImport,
                    };
                }
                WorkerResponseStatus::Success => match entry.import_stage {
                    ImportStage::Background => {
                        entry.migration_status = MigrationStatus::Idle;
                        entry.last_background_sync = Some(now);
                    }
                    // Only a FINAL_IMPORT entry may complete; the store
                    // refuses the transition from anywhere else.
                    ImportStage::Final | ImportStage::Complete => {
                        entry.import_stage = ImportStage::Complete;
                        entry.migration_status = MigrationStatus::ImportComplete;
                        if entry.migration_status_message.is_empty() {
                            entry.migration_status_message = "Import complete".to_string();
                        }
                    }
                },
                WorkerResponseStatus::Failed => {
                    entry.migration_status = MigrationStatus::Error;
                }
            }

            tx.update_queue_entry(&entry)?;
            Ok::<_, MigrationError>((entry, instance))
        })?;

        debug!(instance = %uuid, status = %entry.migration_status, "Applied worker response");

        match entry.migration_status {
            MigrationStatus::ImportComplete => {
                info!(instance = %uuid, batch = %entry.batch_name, "Import complete");
                audit_log!(AuditRecord::new(AuditCategory::WorkerProtocol, "WorkerHandler", "import")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(uuid.to_string())
                    .with_object_type("instance")
                    .with_batch(&entry.batch_name));
            }
            MigrationStatus::Error => {
                warn!(instance = %uuid, batch = %entry.batch_name, error = %entry.migration_status_message,
                    "Worker reported failure");
                audit_log!(AuditRecord::new(AuditCategory::WorkerProtocol, "WorkerHandler", "import")
                    .with_object_id(uuid.to_string())
                    .with_object_type("instance")
                    .with_batch(&entry.batch_name)
                    .with_error(&entry.migration_status_message));
                self.restore_source(&instance).await;
            }
            _ => {}
        }

        Ok(())
    }

    /// Errors worker-owned instances of RUNNING batches whose worker has
    /// not been heard from within the worker timeout.
    pub fn check_liveness(&self) -> MigrationResult<usize> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.ctx.config.worker_timeout())
            .map_err(|e| MigrationError::Config(format!("Invalid worker timeout: {}", e)))?;

        let timed_out = self.ctx.store.transaction(|tx| {
            let mut timed_out = Vec::new();
            for batch in tx.get_batches_by_status(BatchStatus::Running)? {
                for entry in tx.get_queue_entries_by_batch(&batch.name)? {
                    if !entry.migration_status.is_worker_owned() {
                        continue;
                    }
                    if let Err(e) = check_alive(entry.last_worker_update, now, timeout) {
                        tx.set_migration_status(entry.instance_uuid, MigrationStatus::Error, &e.to_string())?;
                        timed_out.push((entry, e));
                    }
                }
            }
            Ok::<_, MigrationError>(timed_out)
        })?;

        for (entry, e) in &timed_out {
            warn!(instance = %entry.instance_uuid, batch = %entry.batch_name,
                last_update = ?entry.last_worker_update, error = %e, "Worker went quiet");
            audit_log!(AuditRecord::new(AuditCategory::WorkerProtocol, "WorkerHandler", "liveness")
                .with_object_id(entry.instance_uuid.to_string())
                .with_object_type("instance")
                .with_batch(&entry.batch_name)
                .with_error(e.to_string()));
        }

        Ok(timed_out.len())
    }

    /// Best-effort power-on of the source VM after a failed migration.
    async fn restore_source(&self, instance: &Instance) {
        if !instance.properties.running {
            return;
        }

        let source = match self.ctx.store.transaction(|tx| tx.get_source(&instance.source)) {
            Ok(Some(source)) => source,
            Ok(None) => {
                warn!(instance = %instance.uuid, source = %instance.source, "Source no longer exists, cannot power on VM");
                return;
            }
            Err(e) => {
                warn!(instance = %instance.uuid, error = %e, "Failed to look up source");
                return;
            }
        };

        let location = &instance.properties.location;
        match self.power_on(&source, location).await {
            Ok(()) => info!(instance = %instance.uuid, location = %location, "Powered source VM back on"),
            Err(e) => warn!(instance = %instance.uuid, location = %location, error = %e,
                "Failed to power source VM back on"),
        }
    }

    async fn power_on(&self, source: &Source, location: &str) -> EndpointResult<()> {
        let endpoint = self.ctx.endpoints.source(source)?;
        endpoint.connect().await?;
        endpoint.power_on_vm(location).await
    }
}

/// Loads the entry for `uuid` and checks the presented token against it.
fn authenticate(tx: &Tx<'_>, uuid: Uuid, token: Uuid) -> MigrationResult<(QueueEntry, Instance, Batch)> {
    let entry = match tx.get_queue_entry(uuid)? {
        Some(entry) if entry.secret_token == token => entry,
        _ => {
            security_audit!(AuditRecord::new(AuditCategory::Authentication, "WorkerHandler", "authenticate")
                .with_outcome(AuditOutcome::Denied)
                .with_object_id(uuid.to_string())
                .with_object_type("instance")
                .with_error("Invalid secret token"));
            return Err(MigrationError::Authentication(uuid));
        }
    };

    let instance = tx.require_instance(uuid)?;
    let batch = tx.require_batch(&entry.batch_name)?;
    Ok((entry, instance, batch))
}

fn next_command(
    tx: &Tx<'_>,
    entry: &mut QueueEntry,
    batch: &Batch,
    now: DateTime<Utc>,
) -> MigrationResult<WorkerCommandType> {
    if entry.migration_status.is_terminal() || entry.import_stage == ImportStage::Complete {
        return Ok(WorkerCommandType::Shutdown);
    }
    if batch.status != BatchStatus::Running || !entry.migration_status.is_worker_owned() {
        return Ok(WorkerCommandType::Idle);
    }

    // A sync in progress finishes in the stage it was started in.
    if entry.import_stage == ImportStage::Background
        && entry.migration_status == MigrationStatus::Idle
        && entry.last_background_sync.is_some()
        && batch.final_import_allowed(now)
    {
        debug!(instance = %entry.instance_uuid, "Switching to final import");
        entry.import_stage = ImportStage::Final;
    }

    let command = match entry.import_stage {
        ImportStage::Complete => WorkerCommandType::Shutdown,
        // A zero limit leaves final syncs unbounded.
        ImportStage::Final => {
            let in_final = tx.count_queue_entries_by_batch_and_status(&batch.name, MigrationStatus::FinalImport)?;
            if entry.migration_status != MigrationStatus::FinalImport
                && batch.config.final_sync_limit > 0
                && in_final >= batch.config.final_sync_limit
            {
                WorkerCommandType::Idle
            } else {
                WorkerCommandType::FinalSync
            }
        }
        ImportStage::Background => match entry.last_background_sync {
            None => WorkerCommandType::InitialSync,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or_default();
                if elapsed >= batch.config.background_sync_interval() {
                    WorkerCommandType::BackgroundSync
                } else {
                    WorkerCommandType::Idle
                }
            }
        },
    };

    Ok(command)
}

fn check_alive(last_update: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: chrono::Duration) -> TaskResult<()> {
    match last_update {
        Some(last) if now - last <= timeout => Ok(()),
        _ => Err(TaskError::liveness("Timed out waiting for worker")),
    }
}
