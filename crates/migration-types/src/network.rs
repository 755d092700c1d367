//! Source network catalog entries.

use serde::{Deserialize, Serialize};

/// A source virtual network, identified by identifier and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub identifier: String,
    pub location: String,
    pub source: String,
    /// Display name at the source, used as the default target network name.
    pub name: String,
    /// Operator-chosen target network, overriding `name`.
    pub target_network: Option<String>,
}

impl Network {
    /// Target network that NICs attached to this network are wired to.
    pub fn target_name(&self) -> &str {
        self.target_network.as_deref().unwrap_or(&self.name)
    }
}
