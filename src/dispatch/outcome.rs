//! Per-worker outcomes and their aggregate

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::failure::ExecutionFailure;
use crate::protocol::OkReply;
use super::WorkerId;

/// What happened to one participant of a dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParticipantOutcome {
    Succeeded,
    /// The worker ran the command and it failed
    Failed(ExecutionFailure),
    /// The worker could not be reached or left mid-dispatch
    Unreachable { reason: String },
    /// No answer within the participant timeout
    TimedOut { after_ms: u64 },
    /// The dispatch was cancelled before this worker answered
    Cancelled,
}

impl ParticipantOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ParticipantOutcome::Succeeded)
    }

    /// Whether the worker itself is at fault
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ParticipantOutcome::Failed(_)
                | ParticipantOutcome::Unreachable { .. }
                | ParticipantOutcome::TimedOut { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ParticipantOutcome::Succeeded => "succeeded",
            ParticipantOutcome::Failed(_) => "failed",
            ParticipantOutcome::Unreachable { .. } => "unreachable",
            ParticipantOutcome::TimedOut { .. } => "timed_out",
            ParticipantOutcome::Cancelled => "cancelled",
        }
    }

    /// Human-readable reason for anything but success
    pub fn reason(&self) -> Option<&str> {
        match self {
            ParticipantOutcome::Failed(failure) => Some(failure.message()),
            ParticipantOutcome::Unreachable { reason } => Some(reason),
            ParticipantOutcome::TimedOut { .. } => Some("no reply within participant timeout"),
            ParticipantOutcome::Cancelled => Some("dispatch cancelled"),
            ParticipantOutcome::Succeeded => None,
        }
    }
}

/// Outcomes of one dispatch keyed by worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub dispatch_id: Uuid,
    pub outcomes: BTreeMap<WorkerId, ParticipantOutcome>,
}

impl DispatchReport {
    pub fn new(dispatch_id: Uuid) -> Self {
        Self {
            dispatch_id,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, worker: WorkerId, outcome: ParticipantOutcome) {
        self.outcomes.insert(worker, outcome);
    }

    pub fn get(&self, worker: &WorkerId) -> Option<&ParticipantOutcome> {
        self.outcomes.get(worker)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(ParticipantOutcome::is_success)
    }

    pub fn successes(&self) -> impl Iterator<Item = &WorkerId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_success())
            .map(|(id, _)| id)
    }

    /// Participants that did not succeed
    pub fn failures(&self) -> impl Iterator<Item = (&WorkerId, &ParticipantOutcome)> {
        self.outcomes.iter().filter(|(_, o)| !o.is_success())
    }

    /// The worker, if exactly one participant did not succeed and it ran
    /// the command and reported a failure
    fn sole_execution_failure(&self) -> Option<WorkerId> {
        let mut failures = self.failures();
        match (failures.next(), failures.next()) {
            (Some((id, ParticipantOutcome::Failed(_))), None) => Some(id.clone()),
            _ => None,
        }
    }

    /// One line naming every participant that did not succeed
    pub fn summary(&self) -> String {
        let failed: Vec<String> = self
            .failures()
            .map(|(id, o)| format!("{} {}: {}", id, o.label(), o.reason().unwrap_or("")))
            .collect();
        format!(
            "{} of {} workers did not succeed ({})",
            failed.len(),
            self.len(),
            failed.join("; ")
        )
    }
}

/// Final answer of a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateResult {
    /// Every participant succeeded
    Ok(OkReply),
    /// At least one participant did not succeed
    Failed(DispatchReport),
    /// The caller gave up; pending participants are reported as cancelled
    Cancelled(DispatchReport),
}

impl AggregateResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, AggregateResult::Ok(_))
    }

    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            AggregateResult::Ok(_) => None,
            AggregateResult::Failed(report) | AggregateResult::Cancelled(report) => Some(report),
        }
    }

    /// Collapse into a crate error for callers that only care about success
    ///
    /// A dispatch whose only problem is one worker reporting a failure
    /// yields that [`ExecutionFailure`] itself.
    pub fn into_result(self, kind: &str) -> Result<OkReply> {
        match self {
            AggregateResult::Ok(reply) => Ok(reply),
            AggregateResult::Failed(mut report) => {
                if let Some(worker) = report.sole_execution_failure() {
                    if let Some(ParticipantOutcome::Failed(failure)) = report.outcomes.remove(&worker) {
                        return Err(Error::ExecutionFailed(failure));
                    }
                }
                let first_reason = report
                    .failures()
                    .next()
                    .map(|(id, o)| format!("{}: {}", id, o.reason().unwrap_or("")))
                    .unwrap_or_default();
                Err(Error::DispatchFailed {
                    kind: kind.to_string(),
                    failed: report.failures().count(),
                    total: report.len(),
                    first_reason,
                })
            }
            AggregateResult::Cancelled(_) => Err(Error::DispatchCancelled {
                kind: kind.to_string(),
            }),
        }
    }
}
