//! State machine hub: registry, recovery watermark, flush and snapshots.

use std::collections::BTreeMap;

use tracing::warn;

use crate::kernel::machines::{OperationOutcome, StateMachine, StateMachineError};
use crate::kernel::operation::OperationContent;
use crate::kernel::session::SessionTracker;
use crate::kernel::snapshot::{Snapshot, StateKind};

/// Owns every business state machine plus the session tracker.
pub struct StateMachineHub {
    machines: BTreeMap<StateKind, Box<dyn StateMachine>>,
    sessions: SessionTracker,
}

impl StateMachineHub {
    pub fn new(sessions: SessionTracker) -> Self {
        StateMachineHub {
            machines: BTreeMap::new(),
            sessions,
        }
    }

    /// Register `machine` under its kind, replacing any previous one.
    pub fn register(&mut self, machine: Box<dyn StateMachine>) -> &mut Self {
        self.machines.insert(machine.kind(), machine);
        self
    }

    /// Builder form of `register`.
    pub fn with(mut self, machine: Box<dyn StateMachine>) -> Self {
        self.register(machine);
        self
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Load persisted state of the session tracker and every machine.
    pub fn start(&mut self) -> Result<(), StateMachineError> {
        self.sessions.start()?;
        for machine in self.machines.values_mut() {
            machine.start()?;
        }
        Ok(())
    }

    /// Maximum applied index across all machines and the session tracker.
    ///
    /// Recovery replays up to this index; machines that are already past a
    /// replayed index ignore it, and the session tracker rejects replayed
    /// operations for the rest.
    pub fn last_applied_index(&self) -> i64 {
        self.machines
            .values()
            .map(|m| m.last_applied_index())
            .fold(self.sessions.last_applied_index(), i64::max)
    }

    /// Durably flush every machine, then the session tracker.
    pub fn flush(&mut self) -> Result<(), StateMachineError> {
        for machine in self.machines.values_mut() {
            machine.flush()?;
        }
        self.sessions.flush()?;
        Ok(())
    }

    pub fn augment_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), StateMachineError> {
        for machine in self.machines.values() {
            machine.add_to_snapshot(snapshot)?;
        }
        snapshot.add_state(StateKind::SessionTracker, &self.sessions.snapshot())?;
        Ok(())
    }

    pub fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StateMachineError> {
        for machine in self.machines.values_mut() {
            machine.restore_from_snapshot(snapshot)?;
        }
        self.sessions
            .install_snapshot(snapshot.state(StateKind::SessionTracker)?);
        Ok(())
    }

    /// Open a dispatch scope for one batch.
    pub fn command_dispatcher(&mut self) -> CommandDispatcher<'_> {
        self.dispatch_scope().0
    }

    /// Dispatch scope plus the session tracker, borrowed side by side.
    pub fn dispatch_scope(&mut self) -> (CommandDispatcher<'_>, &mut SessionTracker) {
        (
            CommandDispatcher {
                machines: &mut self.machines,
                closed: false,
            },
            &mut self.sessions,
        )
    }
}

/// Short-lived dispatch scope.
///
/// `close` ends the batch on every machine. Dropping an unclosed dispatcher
/// (an error path) still ends the batch, logging any failure.
pub struct CommandDispatcher<'a> {
    machines: &'a mut BTreeMap<StateKind, Box<dyn StateMachine>>,
    closed: bool,
}

impl CommandDispatcher<'_> {
    /// Route `content` to its machine and hand the outcome to `on_result`.
    pub fn dispatch<F>(&mut self, content: &OperationContent, index: u64, on_result: F) -> Result<(), StateMachineError>
    where
        F: FnOnce(OperationOutcome),
    {
        let kind = content.kind();
        let machine = self
            .machines
            .get_mut(&kind)
            .ok_or(StateMachineError::NoMachine(kind))?;
        let outcome = machine.apply(content, index)?;
        on_result(outcome);
        Ok(())
    }

    pub fn close(mut self) -> Result<(), StateMachineError> {
        self.closed = true;
        self.complete_batch()
    }

    fn complete_batch(&mut self) -> Result<(), StateMachineError> {
        for machine in self.machines.values_mut() {
            machine.batch_completed()?;
        }
        Ok(())
    }
}

impl Drop for CommandDispatcher<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.complete_batch() {
                warn!(error = %e, "Failed to complete batch on dispatcher release");
            }
        }
    }
}
