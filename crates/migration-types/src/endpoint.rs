//! Source and target hypervisor environments.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of source hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Vmware,
    Nsx,
    /// A source that needs no SDK artifact.
    Common,
}

impl SourceType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SourceType::Vmware => "vmware",
            SourceType::Nsx => "nsx",
            SourceType::Common => "common",
        }
    }

    /// Returns true if workers need a vendor SDK artifact to talk to this source.
    pub const fn requires_sdk(&self) -> bool {
        matches!(self, SourceType::Vmware)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vmware" => Ok(SourceType::Vmware),
            "nsx" => Ok(SourceType::Nsx),
            "common" => Ok(SourceType::Common),
            _ => Err(ParseError::InvalidSourceType(s.to_string())),
        }
    }
}

/// Kind of target hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Incus,
}

impl TargetType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TargetType::Incus => "incus",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incus" => Ok(TargetType::Incus),
            _ => Err(ParseError::InvalidTargetType(s.to_string())),
        }
    }
}

/// A source hypervisor environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub source_type: SourceType,
    /// Opaque connection description, handed to workers verbatim.
    pub properties: serde_json::Value,
}

/// A target hypervisor environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub target_type: TargetType,
    pub properties: serde_json::Value,
    /// Maximum number of VMs created concurrently on this target.
    pub create_limit: Option<usize>,
}
