//! Cleanup stack for multi-step operations.
//!
//! A [`Reverter`] collects undo steps while an operation makes progress.
//! When the operation reaches its success marker it calls
//! [`Reverter::success`] and the steps are dropped unrun. Otherwise
//! [`Reverter::fail`] runs them newest first. A reverter dropped while still
//! armed schedules its steps on the current tokio runtime.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

type RevertStep = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Cleanup stack armed for the duration of an operation.
#[derive(Default)]
pub struct Reverter {
    steps: Vec<(String, RevertStep)>,
}

impl Reverter {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Pushes an undo step.
    pub fn add<F, Fut>(&mut self, label: impl Into<String>, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.steps
            .push((label.into(), Box::new(move || step().boxed())));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Disarms the reverter: no step will run.
    pub fn success(mut self) {
        self.steps.clear();
    }

    /// Runs every step, newest first.
    pub async fn fail(mut self) {
        let steps = std::mem::take(&mut self.steps);
        run_steps(steps).await;
    }
}

async fn run_steps(steps: Vec<(String, RevertStep)>) {
    for (label, step) in steps.into_iter().rev() {
        log::debug!("Reverting: {}", label);
        step().await;
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }

        let steps = std::mem::take(&mut self.steps);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Reverter dropped while armed, reverting {} steps", steps.len());
                handle.spawn(run_steps(steps));
            }
            Err(_) => {
                log::error!(
                    "Reverter dropped outside a runtime, {} revert steps lost",
                    steps.len()
                );
            }
        }
    }
}
