//! Command execution
//!
//! Runs decoded commands and converts every way they can go wrong (decode
//! error, `Err` result, panic, timeout) into an [`ExecutionFailure`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dispatch::{CommandContext, CommandRegistry, WorkerId, WorkerReply};
use crate::failure::ExecutionFailure;
use crate::protocol::CommandPayload;

/// Executor counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
    pub timed_out: u64,
}

/// Runs commands on behalf of one worker
pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
    timeout: Option<Duration>,
    stats: RwLock<ExecutorStats>,
}

impl CommandExecutor {
    /// Create an executor; `timeout` bounds each command
    pub fn new(registry: Arc<CommandRegistry>, timeout: Option<Duration>) -> Self {
        Self {
            registry,
            timeout,
            stats: RwLock::new(ExecutorStats::default()),
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.read().clone()
    }

    /// Run `payload` and report how it went. Never fails, never panics.
    pub async fn run(
        &self,
        worker_id: &WorkerId,
        dispatch_id: Uuid,
        payload: &CommandPayload,
    ) -> WorkerReply {
        let started = Instant::now();
        self.stats.write().executed += 1;

        let command = match self.registry.decode(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(worker_id = %worker_id, dispatch_id = %dispatch_id, kind = %payload.kind, error = %e, "Cannot decode command");
                self.stats.write().failed += 1;
                return WorkerReply::Failed(ExecutionFailure::new(e.to_string()));
            }
        };

        let ctx = CommandContext {
            worker_id: worker_id.clone(),
            dispatch_id,
        };
        let guarded = AssertUnwindSafe(command.execute(&ctx)).catch_unwind();

        let finished = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(finished) => finished,
                Err(_) => {
                    self.stats.write().timed_out += 1;
                    self.stats.write().failed += 1;
                    warn!(worker_id = %worker_id, dispatch_id = %dispatch_id, kind = %payload.kind, ?limit, "Command timed out");
                    return WorkerReply::Failed(ExecutionFailure::new(format!(
                        "command '{}' timed out after {:?}",
                        payload.kind, limit
                    )));
                }
            },
            None => guarded.await,
        };

        let reply = match finished {
            Ok(Ok(())) => {
                self.stats.write().succeeded += 1;
                WorkerReply::Ok
            }
            Ok(Err(e)) => {
                self.stats.write().failed += 1;
                WorkerReply::Failed(ExecutionFailure::from_error(&e))
            }
            Err(panic) => {
                let mut stats = self.stats.write();
                stats.panicked += 1;
                stats.failed += 1;
                drop(stats);
                WorkerReply::Failed(ExecutionFailure::from_panic(panic))
            }
        };

        debug!(
            worker_id = %worker_id,
            dispatch_id = %dispatch_id,
            kind = %payload.kind,
            ok = matches!(reply, WorkerReply::Ok),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        reply
    }
}
