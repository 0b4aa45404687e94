//! Execution failures
//!
//! [`ExecutionFailure`] is what a worker sends back when a command it was
//! asked to run did not complete. It travels unchanged from the worker,
//! through the dispatcher, to the client that submitted the command.
//!
//! Constructing a failure has no side effects. Logging happens once, at the
//! dispatcher boundary, through a [`FailureSink`].

use std::any::Any;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::dispatch::{ParticipantOutcome, WorkerId};

/// Diagnostic for a command a worker failed to run
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutionFailure {
    message: String,
}

impl ExecutionFailure {
    /// Create a failure with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Capture an error and its full cause chain
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }

    /// Capture a panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(format!("command panicked: {}", detail))
    }

    /// The diagnostic message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Receives every non-successful participant outcome of a dispatch
pub trait FailureSink: Send + Sync {
    fn report(&self, dispatch_id: Uuid, worker: &WorkerId, outcome: &ParticipantOutcome);
}

/// Default sink: one structured `warn!` per failed participant
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn report(&self, dispatch_id: Uuid, worker: &WorkerId, outcome: &ParticipantOutcome) {
        warn!(
            dispatch_id = %dispatch_id,
            worker_id = %worker,
            outcome = outcome.label(),
            reason = outcome.reason().unwrap_or(""),
            "Worker failed to run command"
        );
    }
}
