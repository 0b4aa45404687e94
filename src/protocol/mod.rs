//! Protocol module
//!
//! Defines the message types and serialization shared by the lock protocol
//! and the command broadcast protocol.
//! The protocol uses JSON over WebSocket with versioning support.

mod messages;
mod version;

pub use messages::*;
pub use version::*;
