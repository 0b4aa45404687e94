//! Command broadcast
//!
//! A client submits a command; the [`CommandDispatcher`] sends it to every
//! worker in a membership snapshot, waits for each of them and folds the
//! replies into one [`AggregateResult`].

mod command;
mod dispatcher;
mod link;
mod outcome;
mod registry;

pub use command::{
    CommandContext, CommandRegistry, CommandSpec, ExecCommand, FailCommand, NoopCommand,
    SleepCommand,
};
pub use dispatcher::{CommandDispatcher, DispatchStats, DispatcherConfig};
pub use link::{WorkerLink, WorkerReply};
pub use outcome::{AggregateResult, DispatchReport, ParticipantOutcome};
pub use registry::{Participant, Registration, WorkerId, WorkerRegistry};
pub(crate) use registry::signalled;

pub use crate::protocol::CommandPayload;
