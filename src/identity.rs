//! Peer identities

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one mesh participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub uuid: String,
    pub name: String,
    #[serde(skip)]
    pub is_local: bool,
    #[serde(rename = "coordinator")]
    pub is_coordinator: bool,
}

impl PeerIdentity {
    /// Create the identity of this process with a fresh uuid
    ///
    /// Built once at startup and handed to the signaling hub.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.into(),
            is_local: true,
            is_coordinator: false,
        }
    }

    /// Identity of a remote endpoint
    pub fn remote(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            is_local: false,
            is_coordinator: false,
        }
    }

    pub fn with_coordinator(mut self, coordinator: bool) -> Self {
        self.is_coordinator = coordinator;
        self
    }

    /// Short uuid prefix for log lines
    pub fn short_id(&self) -> &str {
        &self.uuid[..self.uuid.len().min(8)]
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.short_id())
    }
}
