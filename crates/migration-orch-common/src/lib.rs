//! Common orchestration abstractions for the migration engine.
//!
//! This crate provides the building blocks every orchestration phase uses:
//!
//! - [`Phase`]: a unit of periodic work driven by the scheduler
//! - [`TaskError`] / [`TaskStatus`]: failure taxonomy and its consequences
//! - [`Reverter`]: cleanup stack armed while a multi-step operation runs
//! - [`KeyedLock`]: exclusive lock per key, for shared target infrastructure
//!
//! # Architecture
//!
//! The engine runs a fixed set of phases (sync, queue, provisioning,
//! finalization, liveness), each on its own interval:
//!
//! 1. The scheduler ticks each phase independently
//! 2. A phase loads the entities it acts on from the store
//! 3. Per-entity work runs concurrently; each failure is classified as a
//!    [`TaskError`] and recorded on that entity only
//! 4. Multi-step work arms a [`Reverter`] and disarms it at its success marker
//!
//! # Example
//!
//! ```ignore
//! use migration_orch_common::{Phase, TaskResult};
//!
//! struct SyncPhase { /* ... */ }
//!
//! #[async_trait]
//! impl Phase for SyncPhase {
//!     fn name(&self) -> &str { "sync" }
//!     fn interval(&self) -> Duration { Duration::from_secs(600) }
//!     async fn run_once(&self, cancel: &CancellationToken) -> TaskResult<()> {
//!         // ...
//!         Ok(())
//!     }
//! }
//! ```

mod keyed_lock;
mod phase;
mod revert;
mod task;

pub use keyed_lock::{KeyedGuard, KeyedLock};
pub use phase::Phase;
pub use revert::Reverter;
pub use task::{TaskError, TaskResult, TaskStatus};
