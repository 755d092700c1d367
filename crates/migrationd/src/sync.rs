//! Inventory reconciliation against the sources.
//!
//! Each pass reads every VM and network a source reports and brings the
//! catalog in line: new entities are created, descriptive fields of known
//! ones refreshed, and instances the source no longer reports deleted.
//! An instance claimed by a batch is never modified or deleted here.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::batch::refresh_membership;
use crate::context::Context;
use crate::error::{endpoint_task_error, EndpointResultExt};
use chrono::Utc;
use migration_orch_common::{TaskError, TaskResult};
use migration_types::{Instance, MigrationStatus, Network, Source};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What one source pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub networks: usize,
}

pub struct InventorySync {
    ctx: Context,
}

impl InventorySync {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Syncs every source. A failing source is logged and skipped.
    pub async fn run_once(&self) -> TaskResult<()> {
        let sources = self.ctx.store.transaction(|tx| tx.get_sources())?;

        for source in &sources {
            match self.sync_source(source).await {
                Ok(summary) => {
                    debug!(source = %source.name, ?summary, "Synced source");
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "Failed to sync source");
                }
            }
        }

        let (assigned, released) = self.ctx.store.transaction(refresh_membership)?;
        if assigned > 0 || released > 0 {
            info!(assigned, released, "Batch membership changed");
        }
        Ok(())
    }

    pub async fn sync_source(&self, source: &Source) -> TaskResult<SyncSummary> {
        let endpoint = self.ctx.endpoints.source(source).map_err(endpoint_task_error)?;
        endpoint
            .connect()
            .await
            .task_context("Failed to connect to source")?;
        let vms = endpoint
            .get_all_vms()
            .await
            .task_context("Failed to list source VMs")?;
        let networks = endpoint
            .get_all_networks()
            .await
            .task_context("Failed to list source networks")?;

        let summary = self.ctx.store.transaction(|tx| {
            let mut summary = SyncSummary::default();
            let mut known: HashMap<_, Instance> = tx
                .get_instances_by_source(&source.name)?
                .into_iter()
                .map(|instance| (instance.uuid, instance))
                .collect();

            for mut vm in vms {
                vm.source = source.name.clone();
                vm.source_type = source.source_type;

                match known.remove(&vm.uuid) {
                    None => {
                        vm.migration_status = MigrationStatus::NotAssignedBatch;
                        vm.migration_status_message.clear();
                        vm.batch = None;
                        vm.last_update_from_source = Utc::now();
                        tx.create_instance(&vm)?;
                        summary.created += 1;
                    }
                    Some(mut current) => {
                        if current.batch.is_some() || current.properties == vm.properties {
                            continue;
                        }
                        current.properties = vm.properties;
                        current.last_update_from_source = Utc::now();
                        tx.update_instance(&current)?;
                        summary.updated += 1;
                    }
                }
            }

            for (uuid, instance) in known {
                if instance.batch.is_some() {
                    continue;
                }
                tx.delete_instance(uuid)?;
                summary.deleted += 1;
            }

            for mut network in networks {
                network.source = source.name.clone();
                if let Some(existing) = tx.get_network(&network.identifier, &network.location)? {
                    network.target_network = merge_target(&existing, network.target_network);
                    if existing == network {
                        continue;
                    }
                }
                tx.upsert_network(&network)?;
                summary.networks += 1;
            }

            Ok::<_, TaskError>(summary)
        })?;

        if summary != SyncSummary::default() {
            info!(source = %source.name, created = summary.created, updated = summary.updated,
                deleted = summary.deleted, networks = summary.networks, "Inventory changed");
            audit_log!(AuditRecord::new(AuditCategory::InventorySync, "InventorySync", "sync_source")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(&source.name)
                .with_object_type("source")
                .with_details(serde_json::json!({
                    "created": summary.created,
                    "updated": summary.updated,
                    "deleted": summary.deleted,
                    "networks": summary.networks,
                })));
        }

        Ok(summary)
    }
}

/// The operator's target network mapping survives a resync.
fn merge_target(existing: &Network, reported: Option<String>) -> Option<String> {
    existing.target_network.clone().or(reported)
}
