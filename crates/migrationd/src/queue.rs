//! Queueing of started batches.
//!
//! A QUEUED batch is turned into queue entries: every member instance is
//! checked against the migration restrictions and given a placement, which
//! is validated against a fresh snapshot of the target's capabilities.
//! Entries that pass start WAITING; the others are BLOCKED with the reason.
//! Once every member has an entry the batch is RUNNING.
//!
//! BLOCKED entries of RUNNING batches are re-evaluated on every pass, so an
//! operator fixing the cause (an override, a network mapping, an uploaded
//! driver ISO) lets the instance proceed without restarting the batch.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::Context;
use crate::error::{endpoint_task_error, EndpointResultExt};
use crate::placement::{self, restrictions, PlacementResolver};
use crate::store::Tx;
use migration_endpoint::TargetDetails;
use migration_orch_common::{TaskError, TaskResult, TaskStatus};
use migration_types::{Batch, BatchStatus, Instance, MigrationStatus, OsType, Placement, QueueEntry};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

pub struct QueueRunner {
    ctx: Context,
}

/// Target capability snapshots fetched during one pass.
///
/// Snapshots are never reused across passes.
#[derive(Default)]
struct DetailsCache {
    targets: HashMap<String, TargetDetails>,
}

impl QueueRunner {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Queues every QUEUED batch and re-evaluates BLOCKED entries.
    pub async fn run_once(&self) -> TaskResult<()> {
        let (queued, running) = self.ctx.store.transaction(|tx| {
            Ok::<_, TaskError>((
                tx.get_batches_by_status(BatchStatus::Queued)?,
                tx.get_batches_by_status(BatchStatus::Running)?,
            ))
        })?;

        for batch in queued {
            if let Err(e) = self.queue_batch(&batch).await {
                warn!(batch = %batch.name, error = %e, "Failed to queue batch, will retry");
            }
        }

        for batch in running {
            if let Err(e) = self.reevaluate_blocked(&batch).await {
                warn!(batch = %batch.name, error = %e, "Failed to re-evaluate blocked instances");
            }
        }

        Ok(())
    }

    /// Creates queue entries for the members of a QUEUED batch and moves
    /// it to RUNNING.
    ///
    /// An unreachable target aborts the pass for this batch, leaving it
    /// QUEUED for the next one.
    pub async fn queue_batch(&self, batch: &Batch) -> TaskResult<()> {
        let resolver = match PlacementResolver::new(batch) {
            Ok(resolver) => resolver,
            Err(e) => {
                let message = format!("Invalid placement scriptlet: {}", e);
                self.ctx
                    .store
                    .transaction(|tx| tx.set_batch_status(&batch.name, BatchStatus::Error, &message))?;
                warn!(batch = %batch.name, error = %message, "Failed to queue batch");
                return Ok(());
            }
        };

        let members = self.ctx.store.transaction(|tx| {
            let mut members = Vec::new();
            for instance in tx.get_instances_by_batch(&batch.name)? {
                if tx.get_queue_entry(instance.uuid)?.is_none() {
                    members.push(instance);
                }
            }
            Ok::<_, TaskError>(members)
        })?;

        let mut cache = DetailsCache::default();
        let mut entries = Vec::with_capacity(members.len());
        for instance in &members {
            let mut entry = QueueEntry::new(instance.uuid, &batch.name);
            match self.evaluate(batch, &resolver, instance, None, &mut cache).await {
                Ok(placement) => {
                    entry.placement = placement;
                    entry.migration_status_message = "Waiting to be provisioned".to_string();
                }
                Err(e) if e.to_status() == TaskStatus::Blocked => {
                    debug!(instance = %instance.uuid, reason = %e, "Instance blocked");
                    entry.migration_status = MigrationStatus::Blocked;
                    entry.migration_status_message = e.to_string();
                }
                Err(e) => return Err(e),
            }
            entries.push(entry);
        }

        let queued = self.ctx.store.transaction(|tx| {
            // The batch may have been stopped while targets were queried.
            if tx.require_batch(&batch.name)?.status != BatchStatus::Queued {
                return Ok(false);
            }
            for entry in &entries {
                tx.create_queue_entry(entry)?;
            }
            tx.set_batch_status(&batch.name, BatchStatus::Running, "")?;
            Ok::<_, TaskError>(true)
        })?;
        if !queued {
            return Ok(());
        }

        let blocked = entries
            .iter()
            .filter(|e| e.migration_status == MigrationStatus::Blocked)
            .count();
        info!(batch = %batch.name, queued = entries.len(), blocked, "Batch is running");
        audit_log!(AuditRecord::new(AuditCategory::BatchLifecycle, "QueueRunner", "queue")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&batch.name)
            .with_object_type("batch")
            .with_details(serde_json::json!({
                "queued": entries.len(),
                "blocked": blocked,
            })));
        Ok(())
    }

    /// Moves BLOCKED entries of a RUNNING batch back to WAITING once their
    /// cause is gone.
    pub async fn reevaluate_blocked(&self, batch: &Batch) -> TaskResult<usize> {
        let blocked = self.ctx.store.transaction(|tx| {
            let mut blocked = Vec::new();
            for entry in tx.get_queue_entries_by_batch_and_status(&batch.name, MigrationStatus::Blocked)? {
                let instance = tx.require_instance(entry.instance_uuid)?;
                blocked.push((entry, instance));
            }
            Ok::<_, TaskError>(blocked)
        })?;
        if blocked.is_empty() {
            return Ok(0);
        }

        let resolver = PlacementResolver::new(batch).map_err(|e| e.into_task_error())?;
        let mut cache = DetailsCache::default();
        let mut unblocked = 0;

        for (entry, instance) in blocked {
            let existing = (!entry.placement.target.is_empty()).then_some(&entry.placement);
            let placement = match self.evaluate(batch, &resolver, &instance, existing, &mut cache).await {
                Ok(placement) => placement,
                Err(e) if e.to_status() == TaskStatus::Blocked => {
                    if e.to_string() != entry.migration_status_message {
                        self.ctx.store.transaction(|tx| {
                            tx.set_migration_status(instance.uuid, MigrationStatus::Blocked, &e.to_string())
                        })?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let moved = self.ctx.store.transaction(|tx| {
                let mut entry = tx.require_queue_entry(instance.uuid)?;
                if entry.migration_status != MigrationStatus::Blocked {
                    return Ok(false);
                }
                entry.placement = placement;
                entry.migration_status = MigrationStatus::Waiting;
                entry.migration_status_message = "Waiting to be provisioned".to_string();
                tx.update_queue_entry(&entry)?;
                Ok::<_, TaskError>(true)
            })?;

            if moved {
                unblocked += 1;
                info!(batch = %batch.name, instance = %instance.uuid, "Instance no longer blocked");
                audit_log!(AuditRecord::new(AuditCategory::Placement, "QueueRunner", "unblock")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(instance.uuid.to_string())
                    .with_object_type("instance")
                    .with_batch(&batch.name));
            }
        }

        Ok(unblocked)
    }

    /// Restrictions, placement, OS dependencies and placement validation
    /// for one instance. Validation errors mean the instance is blocked.
    async fn evaluate(
        &self,
        batch: &Batch,
        resolver: &PlacementResolver<'_>,
        instance: &Instance,
        existing: Option<&Placement>,
        cache: &mut DetailsCache,
    ) -> TaskResult<Placement> {
        restrictions::check(instance, &batch.config.restriction_overrides)?;

        let catalog = self.ctx.store.transaction(|tx| {
            check_os_dependencies(tx, instance)?;
            catalog_networks(tx, &instance.source)
        })?;

        let placement = resolver.resolve(instance, existing, &catalog)?;
        let details = self.target_details(&placement.target, cache).await?;
        placement::validate(&placement, instance, details)?;
        Ok(placement)
    }

    async fn target_details<'c>(&self, name: &str, cache: &'c mut DetailsCache) -> TaskResult<&'c TargetDetails> {
        if !cache.targets.contains_key(name) {
            let target = self
                .ctx
                .store
                .transaction(|tx| tx.get_target(name))?
                .ok_or_else(|| TaskError::validation(format!("Target {} does not exist", name)))?;

            let endpoint = self.ctx.endpoints.target(&target).map_err(endpoint_task_error)?;
            endpoint
                .connect()
                .await
                .task_context(&format!("Failed to connect to target {}", name))?;
            let details = endpoint
                .get_details()
                .await
                .task_context(&format!("Failed to query target {}", name))?;
            cache.targets.insert(name.to_string(), details);
        }

        cache
            .targets
            .get(name)
            .ok_or_else(|| TaskError::internal(format!("Missing details of target {}", name)))
    }
}

/// Source network identifier to target network name, for one source.
fn catalog_networks(tx: &Tx<'_>, source: &str) -> TaskResult<BTreeMap<String, String>> {
    Ok(tx
        .get_networks_by_source(source)?
        .into_iter()
        .map(|network| {
            let name = network.target_name().to_string();
            (network.identifier, name)
        })
        .collect())
}

/// Windows guests need a driver ISO, appliances an OS image.
fn check_os_dependencies(tx: &Tx<'_>, instance: &Instance) -> TaskResult<()> {
    let properties = &instance.properties;
    match properties.os_type {
        OsType::Windows if tx.find_driver_iso(instance)?.is_none() => Err(TaskError::validation(format!(
            "No driver ISO artifact for {} on {}",
            properties.os, properties.architecture
        ))),
        OsType::Appliance if tx.find_os_image(instance)?.is_none() => Err(TaskError::validation(format!(
            "No OS image artifact for {} {} on {}",
            properties.os, properties.os_version, properties.architecture
        ))),
        _ => Ok(()),
    }
}
