//! Versioned binary dependencies.

use crate::{ParseError, SourceType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Bootable worker image imported as a storage volume.
    Worker,
    /// Vendor SDK used by workers to read source disks.
    Sdk,
    /// Windows driver ISO.
    DriverIso,
    /// Vendor OS image for appliances.
    OsImage,
}

impl ArtifactType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Worker => "worker",
            ArtifactType::Sdk => "sdk",
            ArtifactType::DriverIso => "driver_iso",
            ArtifactType::OsImage => "os_image",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(ArtifactType::Worker),
            "sdk" => Ok(ArtifactType::Sdk),
            "driver_iso" => Ok(ArtifactType::DriverIso),
            "os_image" => Ok(ArtifactType::OsImage),
            _ => Err(ParseError::InvalidArtifactType(s.to_string())),
        }
    }
}

/// Catalog entry of an artifact. Its files live in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub uuid: Uuid,
    pub artifact_type: ArtifactType,
    pub description: String,
    pub os: Option<String>,
    pub architectures: Vec<String>,
    pub versions: Vec<String>,
    pub source_type: Option<SourceType>,
    /// Where to fetch the file from when it is not present locally.
    pub source_url: Option<String>,
}

impl Artifact {
    pub fn new(artifact_type: ArtifactType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            artifact_type,
            description: String::new(),
            os: None,
            architectures: Vec::new(),
            versions: Vec::new(),
            source_type: None,
            source_url: None,
        }
    }

    /// Returns true if the artifact declares support for `arch`
    /// (an empty list means any architecture).
    pub fn supports_architecture(&self, arch: &str) -> bool {
        self.architectures.is_empty() || self.architectures.iter().any(|a| a == arch)
    }

    pub fn supports_os(&self, os: &str) -> bool {
        self.os
            .as_deref()
            .map_or(true, |own| own.eq_ignore_ascii_case(os))
    }

    /// Returns true if the artifact declares `version` (an empty list matches any).
    pub fn supports_version(&self, version: &str) -> bool {
        self.versions.is_empty() || self.versions.iter().any(|v| v == version)
    }
}
