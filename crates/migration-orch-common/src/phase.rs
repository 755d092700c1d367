//! Periodic orchestration phase trait.

use crate::TaskResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A unit of periodic orchestration work.
///
/// The scheduler calls [`run_once`](Phase::run_once) every
/// [`interval`](Phase::interval). Ticks of the same phase never overlap;
/// different phases may run concurrently and coordinate through explicit
/// locks.
///
/// # Error handling
///
/// Per-entity failures are recorded on the entity and must not be returned.
/// An `Err` means the whole tick failed (store unavailable, etc.); the
/// scheduler logs it and tries again on the next tick.
#[async_trait]
pub trait Phase: Send + Sync {
    /// Returns the name of this phase (for logging).
    fn name(&self) -> &str;

    /// Time between two ticks.
    fn interval(&self) -> Duration;

    /// Runs one tick.
    ///
    /// Long waits inside the tick must observe `cancel`.
    async fn run_once(&self, cancel: &CancellationToken) -> TaskResult<()>;
}
