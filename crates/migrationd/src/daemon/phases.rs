//! The periodic phases of the engine.

use crate::context::Context;
use crate::finalize::Finalizer;
use crate::provision::Provisioner;
use crate::queue::QueueRunner;
use crate::sync::InventorySync;
use crate::worker::WorkerHandler;
use async_trait::async_trait;
use migration_orch_common::{Phase, TaskResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reconciles the inventory with every source.
pub struct SyncPhase {
    sync: InventorySync,
    interval: Duration,
}

#[async_trait]
impl Phase for SyncPhase {
    fn name(&self) -> &str {
        "sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self, _cancel: &CancellationToken) -> TaskResult<()> {
        self.sync.run_once().await
    }
}

/// Turns QUEUED batches into queue entries.
pub struct QueuePhase {
    queue: QueueRunner,
    interval: Duration,
}

#[async_trait]
impl Phase for QueuePhase {
    fn name(&self) -> &str {
        "queue"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self, _cancel: &CancellationToken) -> TaskResult<()> {
        self.queue.run_once().await
    }
}

pub struct ProvisionPhase {
    provisioner: Provisioner,
    interval: Duration,
}

#[async_trait]
impl Phase for ProvisionPhase {
    fn name(&self) -> &str {
        "provision"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self, cancel: &CancellationToken) -> TaskResult<()> {
        self.provisioner.run_once(cancel).await
    }
}

pub struct FinalizePhase {
    finalizer: Finalizer,
    interval: Duration,
}

#[async_trait]
impl Phase for FinalizePhase {
    fn name(&self) -> &str {
        "finalize"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self, cancel: &CancellationToken) -> TaskResult<()> {
        self.finalizer.run_once(cancel).await
    }
}

/// Errors instances whose worker stopped reporting.
pub struct LivenessPhase {
    workers: WorkerHandler,
    interval: Duration,
}

#[async_trait]
impl Phase for LivenessPhase {
    fn name(&self) -> &str {
        "liveness"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self, _cancel: &CancellationToken) -> TaskResult<()> {
        self.workers
            .check_liveness()
            .map(|_| ())
            .map_err(|e| e.into_task_error())
    }
}

/// Builds every phase with the intervals from the daemon configuration.
pub fn all(ctx: &Context) -> Vec<Arc<dyn Phase>> {
    let intervals = &ctx.config.intervals;
    vec![
        Arc::new(SyncPhase {
            sync: InventorySync::new(ctx.clone()),
            interval: Duration::from_secs(intervals.sync_secs),
        }),
        Arc::new(QueuePhase {
            queue: QueueRunner::new(ctx.clone()),
            interval: Duration::from_secs(intervals.queue_secs),
        }),
        Arc::new(ProvisionPhase {
            provisioner: Provisioner::new(ctx.clone()),
            interval: Duration::from_secs(intervals.provision_secs),
        }),
        Arc::new(FinalizePhase {
            finalizer: Finalizer::new(ctx.clone()),
            interval: Duration::from_secs(intervals.finalize_secs),
        }),
        Arc::new(LivenessPhase {
            workers: WorkerHandler::new(ctx.clone()),
            interval: Duration::from_secs(intervals.liveness_secs),
        }),
    ]
}
