//! Cluster-wide lock token.
//!
//! At most one member holds the token. A member takes it over by proposing
//! `current + 1`; whichever proposal is applied first wins and every other
//! proposal for the same id is rejected.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::log::NOTHING;
use crate::engine::storage::StateStorage;
use crate::kernel::operation::{MemberId, OperationContent};
use crate::kernel::snapshot::{Snapshot, StateKind};

use super::{unexpected, OperationOutcome, StateMachine, StateMachineError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTokenState {
    /// Current token id (`NOTHING` before the first grant).
    pub token_id: i64,
    pub owner: Option<MemberId>,
    pub last_applied_index: i64,
}

impl Default for LockTokenState {
    fn default() -> Self {
        LockTokenState {
            token_id: NOTHING,
            owner: None,
            last_applied_index: NOTHING,
        }
    }
}

/// Read-only view of the current token, shared with transaction handling.
#[derive(Clone, Debug, Default)]
pub struct LockTokenHandle {
    current: Arc<RwLock<LockTokenState>>,
}

impl LockTokenHandle {
    pub fn token_id(&self) -> i64 {
        self.current.read().token_id
    }

    pub fn owner(&self) -> Option<MemberId> {
        self.current.read().owner
    }

    fn publish(&self, state: LockTokenState) {
        *self.current.write() = state;
    }
}

pub struct LockTokenStateMachine {
    storage: Box<dyn StateStorage<LockTokenState>>,
    state: LockTokenState,
    handle: LockTokenHandle,
}

impl LockTokenStateMachine {
    pub fn new(storage: Box<dyn StateStorage<LockTokenState>>) -> Self {
        LockTokenStateMachine {
            storage,
            state: LockTokenState::default(),
            handle: LockTokenHandle::default(),
        }
    }

    pub fn handle(&self) -> LockTokenHandle {
        self.handle.clone()
    }

    fn set_state(&mut self, state: LockTokenState) {
        self.state = state;
        self.handle.publish(state);
    }
}

impl StateMachine for LockTokenStateMachine {
    fn kind(&self) -> StateKind {
        StateKind::LockToken
    }

    fn start(&mut self) -> Result<(), StateMachineError> {
        let state = self.storage.initial_state()?;
        self.set_state(state);
        Ok(())
    }

    fn apply(&mut self, content: &OperationContent, index: u64) -> Result<OperationOutcome, StateMachineError> {
        let request = match content {
            OperationContent::LockToken(request) => request,
            other => return Err(unexpected(self.kind(), other)),
        };
        if index as i64 <= self.state.last_applied_index {
            return Ok(OperationOutcome::AlreadyApplied);
        }

        let mut next = self.state;
        next.last_applied_index = index as i64;

        let outcome = if request.candidate_id as i64 == self.state.token_id + 1 {
            next.token_id = request.candidate_id as i64;
            next.owner = Some(request.owner);
            OperationOutcome::LockAcquired {
                token_id: request.candidate_id,
            }
        } else {
            OperationOutcome::Rejected {
                reason: format!(
                    "Lock token candidate {} is not the successor of {}",
                    request.candidate_id, self.state.token_id
                ),
            }
        };

        self.set_state(next);
        Ok(outcome)
    }

    fn flush(&mut self) -> Result<(), StateMachineError> {
        Ok(self.storage.persist(&self.state)?)
    }

    fn last_applied_index(&self) -> i64 {
        self.state.last_applied_index
    }

    fn add_to_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), StateMachineError> {
        Ok(snapshot.add_state(StateKind::LockToken, &self.state)?)
    }

    fn restore_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StateMachineError> {
        let state = snapshot.state(StateKind::LockToken)?;
        self.set_state(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStateStorage;
    use crate::kernel::operation::LockTokenRequest;

    fn request(owner: MemberId, candidate_id: u64) -> OperationContent {
        OperationContent::LockToken(LockTokenRequest { owner, candidate_id })
    }

    #[test]
    fn test_only_successor_wins() {
        let mut machine = LockTokenStateMachine::new(Box::new(InMemoryStateStorage::<LockTokenState>::new()));
        let handle = machine.handle();
        let (a, b) = (MemberId::random(), MemberId::random());

        assert_eq!(
            machine.apply(&request(a, 0), 0).unwrap(),
            OperationOutcome::LockAcquired { token_id: 0 }
        );
        assert!(matches!(
            machine.apply(&request(b, 0), 1).unwrap(),
            OperationOutcome::Rejected { .. }
        ));
        assert_eq!(handle.token_id(), 0);
        assert_eq!(handle.owner(), Some(a));

        machine.apply(&request(b, 1), 2).unwrap();
        assert_eq!(handle.owner(), Some(b));
    }

    #[test]
    fn test_restart_publishes_persisted_token() {
        let storage = InMemoryStateStorage::new();
        let owner = MemberId::random();
        {
            let mut machine = LockTokenStateMachine::new(Box::new(storage.clone()));
            machine.apply(&request(owner, 0), 4).unwrap();
            machine.flush().unwrap();
        }

        let mut machine = LockTokenStateMachine::new(Box::new(storage));
        machine.start().unwrap();
        assert_eq!(machine.handle().token_id(), 0);
        assert_eq!(machine.last_applied_index(), 4);
    }
}
