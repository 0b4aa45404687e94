//! Distributed lock coordinator
//!
//! Single-owner-per-key mutual exclusion with FIFO hand-off, bounded waits
//! and lease-based reclaim. Requesters are identified by opaque ids; the
//! server uses the session id of each connection.

mod coordinator;
mod types;

pub use coordinator::{LockCoordinator, LockCoordinatorConfig};
pub(crate) use coordinator::Enqueued;
pub use types::{LockKey, LockStats, RequesterId, DEFAULT_LOCK_KEY};
