//! pdexec coordinator
//!
//! Coordination services for parallel batch execution:
//! - [`lock`]: named mutual-exclusion locks with FIFO hand-off and leases
//! - [`dispatch`]: broadcast of one command to every registered worker,
//!   with per-worker outcomes aggregated into one result
//! - [`failure`]: how a command failure on one worker travels back
//!
//! The [`server`] exposes both over WebSocket; [`worker`] and [`client`]
//! are the two kinds of peers that connect to it.

pub mod cli;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failure;
pub mod lock;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod version;
pub mod worker;

mod transport;

pub use error::{Error, Result};
