//! How the dispatcher reaches a worker

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::failure::ExecutionFailure;
use crate::protocol::CommandPayload;

/// A worker's answer to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Ok,
    Failed(ExecutionFailure),
}

/// Channel to one worker
///
/// `Err` means the worker could not be reached or went away before
/// answering. A command that ran and failed is `Ok(WorkerReply::Failed)`.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    async fn execute(&self, dispatch_id: Uuid, command: &CommandPayload) -> Result<WorkerReply>;
}
