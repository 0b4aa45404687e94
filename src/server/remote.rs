//! Worker reached over a server session
//!
//! Commands go out through the session's outbound queue; replies come back
//! through [`RemoteWorker::complete`], matched by the command envelope id.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::dispatch::{WorkerId, WorkerLink, WorkerReply};
use crate::error::{Error, Result};
use crate::protocol::{CommandMessage, CommandPayload, Message, MessageEnvelope};

/// [`WorkerLink`] for a worker connected to this server
pub struct RemoteWorker {
    id: WorkerId,
    outbound: mpsc::Sender<MessageEnvelope>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<WorkerReply>>>,
}

impl RemoteWorker {
    pub fn new(id: WorkerId, outbound: mpsc::Sender<MessageEnvelope>) -> Self {
        Self {
            id,
            outbound,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver the worker's reply to the command with envelope id `request_id`
    ///
    /// Returns `false` if nobody is waiting for it (late or unknown reply).
    pub fn complete(&self, request_id: Uuid, reply: WorkerReply) -> bool {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(worker_id = %self.id, request_id = %request_id, "Reply for unknown command");
                false
            }
        }
    }

    /// Fail every command still waiting for a reply
    pub fn close(&self) {
        let dropped = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!(worker_id = %self.id, dropped, "Dropped pending commands");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Forgets a pending command when its caller stops waiting
struct PendingSlot<'a> {
    pending: &'a Mutex<HashMap<Uuid, oneshot::Sender<WorkerReply>>>,
    request_id: Uuid,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

#[async_trait]
impl WorkerLink for RemoteWorker {
    async fn execute(&self, dispatch_id: Uuid, command: &CommandPayload) -> Result<WorkerReply> {
        let envelope = MessageEnvelope::new(Message::Command(CommandMessage {
            dispatch_id: Some(dispatch_id),
            command: command.clone(),
        }));
        let request_id = envelope.id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            request_id,
        };

        self.outbound
            .send(envelope)
            .await
            .map_err(|_| Error::unreachable(self.id.as_str(), "connection closed"))?;
        trace!(worker_id = %self.id, dispatch_id = %dispatch_id, "Command sent");

        rx.await
            .map_err(|_| Error::unreachable(self.id.as_str(), "connection closed before reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::ExecutionFailure;

    #[tokio::test]
    async fn test_reply_is_matched_by_envelope_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let remote = RemoteWorker::new(WorkerId::from("w1"), tx);

        let answer = async {
            let sent = rx.recv().await.unwrap();
            assert!(matches!(sent.payload, Message::Command(_)));
            assert!(remote.complete(
                sent.id,
                WorkerReply::Failed(ExecutionFailure::new("disk full"))
            ));
        };
        let payload = CommandPayload::new("noop");
        let (reply, ()) = tokio::join!(
            remote.execute(Uuid::new_v4(), &payload),
            answer
        );

        assert_eq!(
            reply.unwrap(),
            WorkerReply::Failed(ExecutionFailure::new("disk full"))
        );
        assert_eq!(remote.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_makes_worker_unreachable() {
        let (tx, mut rx) = mpsc::channel(4);
        let remote = RemoteWorker::new(WorkerId::from("w1"), tx);

        let closer = async {
            rx.recv().await.unwrap();
            remote.close();
        };
        let payload = CommandPayload::new("noop");
        let (reply, ()) = tokio::join!(
            remote.execute(Uuid::new_v4(), &payload),
            closer
        );

        assert!(matches!(reply, Err(Error::WorkerUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_closed_outbound() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let remote = RemoteWorker::new(WorkerId::from("w1"), tx);

        let reply = remote.execute(Uuid::new_v4(), &CommandPayload::new("noop")).await;
        assert!(matches!(reply, Err(Error::WorkerUnreachable { .. })));
        assert_eq!(remote.pending_count(), 0);
    }

    #[test]
    fn test_unknown_reply() {
        let (tx, _rx) = mpsc::channel(1);
        let remote = RemoteWorker::new(WorkerId::from("w1"), tx);
        assert!(!remote.complete(Uuid::new_v4(), WorkerReply::Ok));
    }
}
