//! Protocol versioning
//!
//! Peers must agree on the major version; minor and patch may differ.

use serde::{Deserialize, Serialize};

/// Current protocol version
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// Create a new version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Check that a peer speaking `other` can talk to this side
    pub fn check_peer(&self, other: &ProtocolVersion) -> crate::Result<()> {
        if self.major == other.major {
            Ok(())
        } else {
            Err(crate::Error::ProtocolVersion {
                expected: self.to_string(),
                actual: other.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
