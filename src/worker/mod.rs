//! Worker side of the command protocol
//!
//! A worker decodes each forwarded command through a
//! [`CommandRegistry`](crate::dispatch::CommandRegistry), runs it, and
//! answers with `OK_REPLY` or `EXECUTION_FAILURE`. Nothing a command does
//! can take the worker down.

mod client;
mod executor;
mod local;

pub use client::{ConnectionState, WorkerClient, WorkerClientConfig, WorkerEvent};
pub use executor::{CommandExecutor, ExecutorStats};
pub use local::LocalWorker;
