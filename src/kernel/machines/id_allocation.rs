//! Cluster-wide id range allocation.
//!
//! Members race to claim the next range of ids per `IdType`. A request wins
//! only if it starts exactly at the first unallocated id, so two members
//! that read the same state cannot both be granted overlapping ranges.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::log::NOTHING;
use crate::engine::storage::StateStorage;
use crate::kernel::operation::{IdAllocationRequest, IdType, OperationContent};
use crate::kernel::snapshot::{Snapshot, StateKind};

use super::{unexpected, OperationOutcome, StateMachine, StateMachineError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocationState {
    /// id type -> first id not yet handed out.
    first_unallocated: BTreeMap<IdType, u64>,
    last_applied_index: i64,
}

impl Default for IdAllocationState {
    fn default() -> Self {
        IdAllocationState {
            first_unallocated: BTreeMap::new(),
            last_applied_index: NOTHING,
        }
    }
}

impl IdAllocationState {
    pub fn first_unallocated(&self, id_type: IdType) -> u64 {
        self.first_unallocated.get(&id_type).copied().unwrap_or(0)
    }
}

pub struct IdAllocationStateMachine {
    storage: Box<dyn StateStorage<IdAllocationState>>,
    state: IdAllocationState,
}

impl IdAllocationStateMachine {
    pub fn new(storage: Box<dyn StateStorage<IdAllocationState>>) -> Self {
        IdAllocationStateMachine {
            storage,
            state: IdAllocationState::default(),
        }
    }

    pub fn state(&self) -> &IdAllocationState {
        &self.state
    }

    fn allocate(&mut self, request: &IdAllocationRequest) -> OperationOutcome {
        let first = self.state.first_unallocated(request.id_type);
        if request.range_start != first {
            return OperationOutcome::Rejected {
                reason: format!(
                    "{:?} range must start at {}, requested {}",
                    request.id_type, first, request.range_start
                ),
            };
        }

        self.state
            .first_unallocated
            .insert(request.id_type, first + request.range_length as u64);
        OperationOutcome::IdRange {
            id_type: request.id_type,
            start: first,
            length: request.range_length,
        }
    }
}

impl StateMachine for IdAllocationStateMachine {
    fn kind(&self) -> StateKind {
        StateKind::IdAllocation
    }

    fn start(&mut self) -> Result<(), StateMachineError> {
        self.state = self.storage.initial_state()?;
        Ok(())
    }

    fn apply(&mut self, content: &OperationContent, index: u64) -> Result<OperationOutcome, StateMachineError> {
        let request = match content {
            OperationContent::IdAllocation(request) => request,
            other => return Err(unexpected(self.kind(), other)),
        };
        if index as i64 <= self.state.last_applied_index {
            return Ok(OperationOutcome::AlreadyApplied);
        }

        let outcome = self.allocate(request);
        self.state.last_applied_index = index as i64;
        Ok(outcome)
    }

    fn flush(&mut self) -> Result<(), StateMachineError> {
        Ok(self.storage.persist(&self.state)?)
    }

    fn last_applied_index(&self) -> i64 {
        self.state.last_applied_index
    }

    fn add_to_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), StateMachineError> {
        Ok(snapshot.add_state(StateKind::IdAllocation, &self.state)?)
    }

    fn restore_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StateMachineError> {
        self.state = snapshot.state(StateKind::IdAllocation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStateStorage;
    use crate::kernel::operation::MemberId;

    fn request(start: u64, length: u32) -> OperationContent {
        OperationContent::IdAllocation(IdAllocationRequest {
            owner: MemberId::random(),
            id_type: IdType::Node,
            range_start: start,
            range_length: length,
        })
    }

    #[test]
    fn test_ranges_granted_in_order() {
        let mut machine = IdAllocationStateMachine::new(Box::new(InMemoryStateStorage::<IdAllocationState>::new()));
        machine.start().unwrap();

        assert_eq!(
            machine.apply(&request(0, 100), 0).unwrap(),
            OperationOutcome::IdRange { id_type: IdType::Node, start: 0, length: 100 }
        );
        // A member that raced with the first one asks for the same start.
        assert!(matches!(
            machine.apply(&request(0, 100), 1).unwrap(),
            OperationOutcome::Rejected { .. }
        ));
        assert_eq!(machine.state().first_unallocated(IdType::Node), 100);
        assert_eq!(machine.state().first_unallocated(IdType::Relationship), 0);
        assert_eq!(machine.last_applied_index(), 1);
    }

    #[test]
    fn test_replayed_index_ignored() {
        let mut machine = IdAllocationStateMachine::new(Box::new(InMemoryStateStorage::<IdAllocationState>::new()));
        machine.apply(&request(0, 10), 5).unwrap();
        assert_eq!(
            machine.apply(&request(10, 10), 5).unwrap(),
            OperationOutcome::AlreadyApplied
        );
        assert_eq!(machine.state().first_unallocated(IdType::Node), 10);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut source = IdAllocationStateMachine::new(Box::new(InMemoryStateStorage::<IdAllocationState>::new()));
        source.apply(&request(0, 64), 3).unwrap();
        let mut snapshot = Snapshot::new(3, 1);
        source.add_to_snapshot(&mut snapshot).unwrap();

        let mut target = IdAllocationStateMachine::new(Box::new(InMemoryStateStorage::<IdAllocationState>::new()));
        target.restore_from_snapshot(&snapshot).unwrap();
        assert_eq!(target.state(), source.state());
    }
}
