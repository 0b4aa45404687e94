//! Init command held by the server
//!
//! The first init command a client submits is kept for the lifetime of the
//! server. Workers connected at that moment run it as a regular broadcast;
//! every worker that connects later runs it before it is admitted to the
//! registry, so it never sees other work first.

use parking_lot::Mutex;
use tracing::info;

use crate::dispatch::{CommandPayload, Participant, Registration, WorkerRegistry};

/// Outcome of trying to admit a worker
pub(crate) enum Admission {
    Admitted,
    /// The init command changed since the caller last looked; run it first
    InitRequired(CommandPayload),
    /// The reservation was removed in the meantime
    Gone,
}

#[derive(Default)]
pub(crate) struct InitSlot {
    command: Mutex<Option<CommandPayload>>,
}

impl InitSlot {
    /// Install `command` unless one is set. On success returns the workers
    /// admitted so far, which still have to run it.
    ///
    /// Admission goes through the same mutex, so every worker either shows
    /// up in the returned snapshot or sees the command in [`admit`](Self::admit).
    pub(crate) fn install(
        &self,
        command: CommandPayload,
        registry: &WorkerRegistry,
    ) -> Option<Vec<Participant>> {
        let mut slot = self.command.lock();
        if slot.is_some() {
            return None;
        }
        info!(kind = %command.kind, "Init command installed");
        *slot = Some(command);
        Some(registry.snapshot())
    }

    /// Admit `registration` if the worker already ran the current init
    /// command (`ran_init`), or if there is none
    pub(crate) fn admit(
        &self,
        registry: &WorkerRegistry,
        registration: &Registration,
        ran_init: bool,
    ) -> Admission {
        let slot = self.command.lock();
        match slot.as_ref() {
            Some(command) if !ran_init => Admission::InitRequired(command.clone()),
            _ if registry.admit(registration) => Admission::Admitted,
            _ => Admission::Gone,
        }
    }
}
