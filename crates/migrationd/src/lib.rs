//! Migration orchestration engine.
//!
//! Moves virtual machines from source hypervisors to a target fleet in
//! batches. The engine owns the batch and instance state machines and
//! drives every instance through them:
//!
//! ```text
//! [sources] --sync--> [catalog] --batch start--> [queue]
//!                                                   |
//!                           provisioning: create target VM, start worker
//!                                                   |
//!           [worker] <--commands / responses--> [engine]
//!                                                   |
//!                           finalization: rewire VM --> FINISHED
//! ```
//!
//! # Key Components
//!
//! - [`batch::BatchManager`]: batch create/start/stop/reset
//! - [`queue::QueueRunner`]: restrictions, placement, QUEUED to RUNNING
//! - [`provision::Provisioner`]: concurrent target VM creation
//! - [`worker::WorkerHandler`]: token-authenticated worker protocol
//! - [`finalize::Finalizer`]: post-migration configuration
//! - [`sync::InventorySync`]: source inventory reconciliation
//! - [`daemon::MigrationDaemon`]: runs the periodic phases

pub mod artifacts;
pub mod audit;
pub mod batch;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod expr;
pub mod finalize;
pub mod placement;
pub mod provision;
pub mod queue;
pub mod store;
pub mod sync;
pub mod worker;

pub use batch::BatchManager;
pub use config::DaemonConfig;
pub use context::Context;
pub use daemon::MigrationDaemon;
pub use error::{MigrationError, MigrationResult, StoreError};
pub use store::Store;
