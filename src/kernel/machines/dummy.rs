use serde::{Deserialize, Serialize};

use crate::engine::log::NOTHING;
use crate::engine::storage::StateStorage;
use crate::kernel::operation::OperationContent;
use crate::kernel::snapshot::{Snapshot, StateKind};

use super::{unexpected, OperationOutcome, StateMachine, StateMachineError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyState {
    pub count: u64,
    pub last_applied_index: i64,
}

impl Default for DummyState {
    fn default() -> Self {
        DummyState {
            count: 0,
            last_applied_index: NOTHING,
        }
    }
}

/// Counts no-op requests.
pub struct DummyStateMachine {
    storage: Box<dyn StateStorage<DummyState>>,
    state: DummyState,
}

impl DummyStateMachine {
    pub fn new(storage: Box<dyn StateStorage<DummyState>>) -> Self {
        DummyStateMachine {
            storage,
            state: DummyState::default(),
        }
    }

    pub fn count(&self) -> u64 {
        self.state.count
    }
}

impl StateMachine for DummyStateMachine {
    fn kind(&self) -> StateKind {
        StateKind::Dummy
    }

    fn start(&mut self) -> Result<(), StateMachineError> {
        self.state = self.storage.initial_state()?;
        Ok(())
    }

    fn apply(&mut self, content: &OperationContent, index: u64) -> Result<OperationOutcome, StateMachineError> {
        if !matches!(content, OperationContent::Dummy(_)) {
            return Err(unexpected(self.kind(), content));
        }
        if index as i64 <= self.state.last_applied_index {
            return Ok(OperationOutcome::AlreadyApplied);
        }
        self.state.count += 1;
        self.state.last_applied_index = index as i64;
        Ok(OperationOutcome::Done)
    }

    fn flush(&mut self) -> Result<(), StateMachineError> {
        Ok(self.storage.persist(&self.state)?)
    }

    fn last_applied_index(&self) -> i64 {
        self.state.last_applied_index
    }

    fn add_to_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), StateMachineError> {
        Ok(snapshot.add_state(StateKind::Dummy, &self.state)?)
    }

    fn restore_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StateMachineError> {
        self.state = snapshot.state(StateKind::Dummy)?;
        Ok(())
    }
}
