//! Fan-out / fan-in of one command across the worker set

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::failure::{FailureSink, TracingFailureSink};
use crate::protocol::{CommandPayload, OkReply};
use super::{
    signalled, AggregateResult, DispatchReport, Participant, ParticipantOutcome, WorkerId, WorkerReply,
    WorkerRegistry,
};

// ─────────────────────────────────────────────────────────────────
// Dispatcher Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the command dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long to wait for each worker; `None` waits until it answers or leaves
    pub participant_timeout: Option<Duration>,

    /// Remove workers that were unreachable or timed out
    pub evict_unreachable: bool,

    /// Remove workers that answered with an execution failure
    pub evict_on_failure: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            participant_timeout: Some(Duration::from_secs(60)),
            evict_unreachable: true,
            evict_on_failure: false,
        }
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatches: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub no_workers: u64,
    pub evictions: u64,
}

// ─────────────────────────────────────────────────────────────────
// Command Dispatcher
// ─────────────────────────────────────────────────────────────────

/// Broadcasts commands to every registered worker
pub struct CommandDispatcher {
    config: DispatcherConfig,
    registry: Arc<WorkerRegistry>,
    sink: Arc<dyn FailureSink>,
    stats: Mutex<DispatchStats>,
}

impl CommandDispatcher {
    /// Create a dispatcher that logs failures through `tracing`
    pub fn new(config: DispatcherConfig, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            config,
            registry,
            sink: Arc::new(TracingFailureSink),
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    /// Replace the failure sink
    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }

    /// Send `command` to every worker registered right now and wait for all
    /// of them
    pub async fn dispatch(&self, command: &CommandPayload) -> Result<AggregateResult> {
        self.dispatch_until(command, std::future::pending::<()>())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), but stop waiting when `cancel`
    /// completes
    ///
    /// Commands already sent are not retracted. Workers that had not
    /// answered are reported as [`ParticipantOutcome::Cancelled`].
    pub async fn dispatch_until<F>(&self, command: &CommandPayload, cancel: F) -> Result<AggregateResult>
    where
        F: Future<Output = ()> + Send,
    {
        self.dispatch_to(self.registry.snapshot(), command, cancel)
            .await
    }

    /// Dispatch to an explicit membership snapshot
    pub async fn dispatch_to<F>(
        &self,
        participants: Vec<Participant>,
        command: &CommandPayload,
        cancel: F,
    ) -> Result<AggregateResult>
    where
        F: Future<Output = ()> + Send,
    {
        if participants.is_empty() {
            self.stats.lock().no_workers += 1;
            debug!(kind = %command.kind, "No workers to dispatch to");
            return Err(Error::NoWorkersAvailable {
                kind: command.kind.clone(),
            });
        }

        let dispatch_id = Uuid::new_v4();
        info!(
            dispatch_id = %dispatch_id,
            kind = %command.kind,
            workers = participants.len(),
            "Dispatching command"
        );

        // Generation each worker had when the snapshot was taken
        let mut pending: BTreeMap<WorkerId, u64> =
            participants.iter().map(|p| (p.id.clone(), p.generation)).collect();
        let generations = pending.clone();
        let mut in_flight: FuturesUnordered<_> = participants
            .into_iter()
            .map(|p| self.run_participant(dispatch_id, command, p))
            .collect();
        let mut report = DispatchReport::new(dispatch_id);

        tokio::pin!(cancel);
        let cancelled = loop {
            tokio::select! {
                next = in_flight.next() => match next {
                    Some((id, outcome)) => {
                        pending.remove(&id);
                        report.record(id, outcome);
                    }
                    None => break false,
                },
                _ = &mut cancel => break true,
            }
        };
        drop(in_flight);

        if cancelled {
            for id in pending.into_keys() {
                report.record(id, ParticipantOutcome::Cancelled);
            }
        }

        for (id, outcome) in report.failures().filter(|(_, o)| o.is_failure()) {
            self.sink.report(dispatch_id, id, outcome);
        }
        self.evict(&report, &generations);

        let result = if cancelled {
            AggregateResult::Cancelled(report)
        } else if report.all_succeeded() {
            AggregateResult::Ok(OkReply {})
        } else {
            AggregateResult::Failed(report)
        };

        let mut stats = self.stats.lock();
        stats.dispatches += 1;
        match &result {
            AggregateResult::Ok(_) => stats.succeeded += 1,
            AggregateResult::Failed(_) => stats.failed += 1,
            AggregateResult::Cancelled(_) => stats.cancelled += 1,
        }
        drop(stats);

        info!(
            dispatch_id = %dispatch_id,
            kind = %command.kind,
            ok = result.is_ok(),
            cancelled,
            "Dispatch finished"
        );
        Ok(result)
    }

    async fn run_participant(
        &self,
        dispatch_id: Uuid,
        command: &CommandPayload,
        participant: Participant,
    ) -> (WorkerId, ParticipantOutcome) {
        let Participant { id, link, departed, .. } = participant;

        let reply = async {
            match self.config.participant_timeout {
                Some(limit) => tokio::time::timeout(limit, link.execute(dispatch_id, command))
                    .await
                    .map_err(|_| limit),
                None => Ok(link.execute(dispatch_id, command).await),
            }
        };

        let outcome = tokio::select! {
            biased;
            reply = reply => match reply {
                Ok(Ok(WorkerReply::Ok)) => ParticipantOutcome::Succeeded,
                Ok(Ok(WorkerReply::Failed(failure))) => ParticipantOutcome::Failed(failure),
                Ok(Err(err)) => ParticipantOutcome::Unreachable { reason: err.to_string() },
                Err(limit) => ParticipantOutcome::TimedOut { after_ms: limit.as_millis() as u64 },
            },
            _ = signalled(departed) => ParticipantOutcome::Unreachable {
                reason: "worker disconnected".to_string(),
            },
        };

        debug!(dispatch_id = %dispatch_id, worker_id = %id, outcome = outcome.label(), "Participant finished");
        (id, outcome)
    }

    /// Remove misbehaving participants. Only the registration that took
    /// part is removed; a worker that reconnected under the same id stays.
    fn evict(&self, report: &DispatchReport, generations: &BTreeMap<WorkerId, u64>) {
        for (id, outcome) in report.failures() {
            let evict = match outcome {
                ParticipantOutcome::Unreachable { .. } | ParticipantOutcome::TimedOut { .. } => {
                    self.config.evict_unreachable
                }
                ParticipantOutcome::Failed(_) => self.config.evict_on_failure,
                _ => false,
            };
            let Some(&generation) = generations.get(id) else {
                continue;
            };
            if evict && self.registry.deregister_generation(id, generation) {
                self.stats.lock().evictions += 1;
                warn!(worker_id = %id, outcome = outcome.label(), "Evicted worker after failed dispatch");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
