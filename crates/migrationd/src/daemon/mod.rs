//! Phase scheduler.
//!
//! The daemon owns the registered phases and runs each one in its own
//! tokio task on its own interval:
//!
//! - missed ticks are skipped, so a slow tick delays the next one instead of
//!   piling up behind it
//! - a failed tick is logged and the phase carries on
//! - all phases stop when the shared cancellation token fires

pub mod phases;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use migration_orch_common::Phase;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct MigrationDaemon {
    phases: Vec<Arc<dyn Phase>>,
    cancel: CancellationToken,
}

impl MigrationDaemon {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            phases: Vec::new(),
            cancel,
        }
    }

    pub fn register_phase(&mut self, phase: Arc<dyn Phase>) {
        info!(phase = phase.name(), interval_ms = phase.interval().as_millis() as u64, "Registering phase");
        self.phases.push(phase);
    }

    /// Token that stops the daemon when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every phase until the token is cancelled, then waits for all
    /// of them to return.
    pub async fn run(self) {
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "MigrationDaemon", "start")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({ "phases": self.phases.len() })));

        let mut tasks = JoinSet::new();
        for phase in self.phases {
            tasks.spawn(run_phase(phase, self.cancel.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Phase task panicked");
            }
        }

        info!("All phases stopped");
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "MigrationDaemon", "stop")
            .with_outcome(AuditOutcome::Success));
    }
}

async fn run_phase(phase: Arc<dyn Phase>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(phase.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(phase = phase.name(), "Phase shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = phase.run_once(&cancel).await {
                    warn!(phase = phase.name(), error = %e, "Phase tick failed");
                    audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, "MigrationDaemon", "tick")
                        .with_object_id(phase.name())
                        .with_object_type("phase")
                        .with_error(e.to_string()));
                }
            }
        }
    }
}
