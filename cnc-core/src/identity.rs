//! Session identity: a stable random identifier for this instance.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque peer identifier (UUID v4 text form). Carried in envelopes and as the
/// `sender` of posts and direct messages.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new random identifier.
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First six characters, used when showing a peer in status lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(6)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of this process. Generated once and kept for the lifetime of the
/// instance; sessions come and go but the local id does not change.
#[derive(Debug, Clone)]
pub struct Identity {
    local_id: PeerId,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            local_id: PeerId::generate(),
        }
    }

    /// Use a known identifier (e.g. one persisted by the host).
    pub fn with_id(local_id: impl Into<PeerId>) -> Self {
        Self {
            local_id: local_id.into(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }
}

/// Fresh collision-resistant token for post and transfer ids.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
