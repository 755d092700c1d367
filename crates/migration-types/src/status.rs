//! Batch and instance lifecycle states.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Batch exists and gathers members, nothing has been queued.
    #[default]
    Defined,
    /// Batch was started and awaits placement of its members.
    Queued,
    /// Queue entries exist and instances are being migrated.
    Running,
    /// Operator stopped the batch.
    Stopped,
    /// Every queue entry reached a terminal state.
    Finished,
    /// A batch-wide failure occurred.
    Error,
}

impl BatchStatus {
    /// Returns the canonical database representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Defined => "defined",
            BatchStatus::Queued => "queued",
            BatchStatus::Running => "running",
            BatchStatus::Stopped => "stopped",
            BatchStatus::Finished => "finished",
            BatchStatus::Error => "error",
        }
    }

    /// Returns true once the batch has been started at least once and not reset.
    pub const fn is_started(&self) -> bool {
        !matches!(self, BatchStatus::Defined)
    }

    /// Returns true if the lifecycle allows moving from `self` to `next`.
    ///
    /// Reset (any state back to `Defined`) is always allowed.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;

        if *self == next || next == Defined {
            return true;
        }

        matches!(
            (self, next),
            (Defined, Queued)
                | (Defined, Error)
                | (Queued, Running)
                | (Queued, Stopped)
                | (Queued, Error)
                | (Running, Stopped)
                | (Running, Finished)
                | (Running, Error)
                | (Stopped, Queued)
                | (Stopped, Error)
                | (Error, Queued)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "defined" => Ok(BatchStatus::Defined),
            "queued" => Ok(BatchStatus::Queued),
            "running" => Ok(BatchStatus::Running),
            "stopped" => Ok(BatchStatus::Stopped),
            "finished" => Ok(BatchStatus::Finished),
            "error" => Ok(BatchStatus::Error),
            _ => Err(ParseError::InvalidBatchStatus(s.to_string())),
        }
    }
}

/// Migration state of a single instance (and of its queue entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    NotAssignedBatch,
    AssignedBatch,
    /// Queued, waiting for the provisioning pipeline.
    Waiting,
    /// Placement or a restriction prevents migration.
    Blocked,
    /// Target VM shell is being created.
    Creating,
    /// Worker is up and waiting for its next command.
    Idle,
    BackgroundImport,
    FinalImport,
    /// Worker reported the final sync as done.
    ImportComplete,
    Finished,
    Error,
}

impl MigrationStatus {
    /// Returns the canonical database representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::NotAssignedBatch => "not_assigned_batch",
            MigrationStatus::AssignedBatch => "assigned_batch",
            MigrationStatus::Waiting => "waiting",
            MigrationStatus::Blocked => "blocked",
            MigrationStatus::Creating => "creating",
            MigrationStatus::Idle => "idle",
            MigrationStatus::BackgroundImport => "background_import",
            MigrationStatus::FinalImport => "final_import",
            MigrationStatus::ImportComplete => "import_complete",
            MigrationStatus::Finished => "finished",
            MigrationStatus::Error => "error",
        }
    }

    /// States in which the in-guest worker owns progress and must keep reporting.
    pub const fn is_worker_owned(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Idle | MigrationStatus::BackgroundImport | MigrationStatus::FinalImport
        )
    }

    /// States counted against concurrency constraints.
    pub const fn is_in_flight(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Creating
                | MigrationStatus::Idle
                | MigrationStatus::BackgroundImport
                | MigrationStatus::FinalImport
        )
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Finished | MigrationStatus::Error)
    }

    /// Returns true if moving from `self` to `next` is a legal step.
    ///
    /// The forward chain is `AssignedBatch -> Waiting -> Creating -> Idle ->
    /// BackgroundImport <-> Idle -> FinalImport -> ImportComplete -> Finished`.
    /// `Error` and `Blocked` are reachable from every non-terminal state and
    /// any state may be reset back to `AssignedBatch`.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;

        if *self == next || next == AssignedBatch {
            return true;
        }

        if next == Error || next == Blocked {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (NotAssignedBatch, AssignedBatch)
                | (AssignedBatch, NotAssignedBatch)
                | (AssignedBatch, Waiting)
                | (Waiting, Creating)
                | (Blocked, Waiting)
                | (Creating, Waiting)
                | (Creating, Idle)
                | (Idle, BackgroundImport)
                | (Idle, FinalImport)
                | (BackgroundImport, Idle)
                | (FinalImport, ImportComplete)
                | (ImportComplete, Finished)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_assigned_batch" => Ok(MigrationStatus::NotAssignedBatch),
            "assigned_batch" => Ok(MigrationStatus::AssignedBatch),
            "waiting" => Ok(MigrationStatus::Waiting),
            "blocked" => Ok(MigrationStatus::Blocked),
            "creating" => Ok(MigrationStatus::Creating),
            "idle" => Ok(MigrationStatus::Idle),
            "background_import" => Ok(MigrationStatus::BackgroundImport),
            "final_import" => Ok(MigrationStatus::FinalImport),
            "import_complete" => Ok(MigrationStatus::ImportComplete),
            "finished" => Ok(MigrationStatus::Finished),
            "error" => Ok(MigrationStatus::Error),
            _ => Err(ParseError::InvalidMigrationStatus(s.to_string())),
        }
    }
}

/// Which data sync the worker performs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStage {
    /// Incremental syncs while the source VM keeps running.
    #[default]
    Background,
    /// Offline cutover sync.
    Final,
    Complete,
}

impl ImportStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ImportStage::Background => "background",
            ImportStage::Final => "final",
            ImportStage::Complete => "complete",
        }
    }
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "background" => Ok(ImportStage::Background),
            "final" => Ok(ImportStage::Final),
            "complete" => Ok(ImportStage::Complete),
            _ => Err(ParseError::InvalidImportStage(s.to_string())),
        }
    }
}
