//! Wire types exchanged with the in-guest worker.

use crate::SourceType;
use serde::{Deserialize, Serialize};

/// What the worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCommandType {
    /// Nothing to do yet, poll again later.
    Idle,
    /// First full copy of every disk.
    InitialSync,
    /// Incremental copy while the source keeps running.
    BackgroundSync,
    /// Power off the source and copy the remaining changes.
    FinalSync,
    /// Migration is complete, shut down the worker.
    Shutdown,
}

/// Command returned to a worker polling for work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub command: WorkerCommandType,
    /// Inventory location of the source VM.
    pub location: String,
    pub source_type: SourceType,
    /// Connection description of the source, opaque to the engine.
    pub source: serde_json::Value,
    pub os: String,
    pub os_version: String,
    pub os_type: crate::OsType,
    pub architecture: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerResponseStatus {
    Running,
    Success,
    Failed,
}

/// Status report posted by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: WorkerResponseStatus,
    #[serde(default)]
    pub status_message: String,
}
