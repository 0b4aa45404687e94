//! Lock identity types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Key used when a request names no lock
pub const DEFAULT_LOCK_KEY: &str = "default";

/// Name of a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key carried by a wire request; absent or empty means the default lock
    pub fn from_wire(key: Option<String>) -> Self {
        match key {
            Some(k) if !k.is_empty() => Self(k),
            _ => Self::default(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockKey {
    fn default() -> Self {
        Self(DEFAULT_LOCK_KEY.to_string())
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity of whoever asks for a lock (a session id on the server)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(String);

impl RequesterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequesterId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Lifetime counters of a lock coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Locks granted, immediately or by hand-off
    pub grants: u64,
    /// Accepted unlocks
    pub releases: u64,
    /// Unlocks rejected because the caller was not the holder
    pub rejected_unlocks: u64,
    /// Waits that ran out of time
    pub timeouts: u64,
    /// Waits abandoned before being granted
    pub cancellations: u64,
    /// Locks taken back after their lease ran out
    pub reclaims: u64,
}
