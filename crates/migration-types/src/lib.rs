//! Common types for VM migration orchestration.
//!
//! This crate provides the data model shared by the migration engine,
//! the endpoint bindings and the test fixtures:
//!
//! - [`Batch`]: a named group of instances migrated together
//! - [`Instance`]: a source VM and its migration state
//! - [`QueueEntry`]: one migration attempt of one instance
//! - [`Placement`]: resolved target/project/pool/network mapping
//! - [`Target`] / [`Source`]: hypervisor environments
//! - [`Network`] / [`Artifact`]: catalog entries
//! - [`WorkerCommand`] / [`WorkerResponse`]: in-guest worker wire types

mod artifact;
mod batch;
mod endpoint;
mod instance;
mod network;
mod queue;
mod status;
mod worker;

pub use artifact::{Artifact, ArtifactType};
pub use batch::{
    defaults, Batch, BatchConfig, BatchDefaults, Constraint, MigrationWindow,
    RestrictionOverrides,
};
pub use endpoint::{Source, SourceType, Target, TargetType};
pub use instance::{
    Disk, Instance, InstanceOverrides, InstanceProperties, Nic, OsType, Snapshot,
};
pub use network::Network;
pub use queue::{Placement, QueueEntry};
pub use status::{BatchStatus, ImportStage, MigrationStatus};
pub use worker::{WorkerCommand, WorkerCommandType, WorkerResponse, WorkerResponseStatus};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid batch status: {0}")]
    InvalidBatchStatus(String),

    #[error("invalid migration status: {0}")]
    InvalidMigrationStatus(String),

    #[error("invalid import stage: {0}")]
    InvalidImportStage(String),

    #[error("invalid OS type: {0}")]
    InvalidOsType(String),

    #[error("invalid artifact type: {0}")]
    InvalidArtifactType(String),

    #[error("invalid source type: {0}")]
    InvalidSourceType(String),

    #[error("invalid target type: {0}")]
    InvalidTargetType(String),
}
