//! In-process worker
//!
//! Lets a dispatcher drive an executor directly, without a connection.
//! Used for embedding and in tests.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dispatch::{WorkerId, WorkerLink, WorkerReply};
use crate::error::Result;
use crate::protocol::CommandPayload;
use super::CommandExecutor;

/// A [`WorkerLink`] backed by a local [`CommandExecutor`]
pub struct LocalWorker {
    id: WorkerId,
    executor: Arc<CommandExecutor>,
}

impl LocalWorker {
    pub fn new(id: impl Into<WorkerId>, executor: Arc<CommandExecutor>) -> Self {
        Self {
            id: id.into(),
            executor,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }
}

#[async_trait]
impl WorkerLink for LocalWorker {
    async fn execute(&self, dispatch_id: Uuid, command: &CommandPayload) -> Result<WorkerReply> {
        Ok(self.executor.run(&self.id, dispatch_id, command).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CommandRegistry;
    use crate::failure::ExecutionFailure;

    #[tokio::test]
    async fn test_local_worker_uses_its_id() {
        let executor = Arc::new(CommandExecutor::new(
            Arc::new(CommandRegistry::with_builtins()),
            None,
        ));
        let w1 = LocalWorker::new("w1", executor.clone());
        let w2 = LocalWorker::new("w2", executor);
        let cmd = CommandPayload::with_args(
            "fail",
            serde_json::json!({ "message": "disk full", "only_on": "w2" }),
        );

        assert_eq!(w1.execute(Uuid::new_v4(), &cmd).await.unwrap(), WorkerReply::Ok);
        assert_eq!(
            w2.execute(Uuid::new_v4(), &cmd).await.unwrap(),
            WorkerReply::Failed(ExecutionFailure::new("disk full"))
        );
    }
}
