//! Test infrastructure for the migration engine.
//!
//! Provides:
//! - Fixtures for instances, batches, catalog entries and target capabilities
//! - In-memory source and target endpoints with failure injection
//! - An endpoint factory handing out those endpoints

pub mod fakes;
pub mod fixtures;

pub use fakes::{FakeFactory, FakeSource, FakeTarget, SourceState, TargetState};
pub use fixtures::*;
