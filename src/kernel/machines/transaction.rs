//! Transaction application.
//!
//! Transactions are prepared on some member under the lock token it held at
//! the time. If the token moved before the transaction reached the log, the
//! transaction is rejected; otherwise it is handed to the storage engine.

use serde::{Deserialize, Serialize};

use crate::engine::log::NOTHING;
use crate::engine::storage::StateStorage;
use crate::kernel::operation::{OperationContent, TransactionRequest};
use crate::kernel::snapshot::{Snapshot, StateKind};

use super::lock_token::LockTokenHandle;
use super::{unexpected, OperationOutcome, StateMachine, StateMachineError};

/// Storage engine that makes committed transactions durable.
pub trait TransactionCommitter: Send {
    /// Commit `request` at log `index`; returns the transaction id.
    fn commit(&mut self, request: &TransactionRequest, index: u64) -> Result<u64, String>;

    /// Log index of the last durable commit (`NOTHING` if none).
    ///
    /// Commits become durable ahead of the machine's own state, so replay
    /// after a crash must skip everything up to this index.
    fn last_committed_index(&self) -> i64;

    /// End of a dispatch batch.
    fn batch_completed(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Make every commit so far durable.
    fn flush(&mut self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionState {
    pub last_committed_index: i64,
}

impl Default for TransactionState {
    fn default() -> Self {
        TransactionState {
            last_committed_index: NOTHING,
        }
    }
}

pub struct TransactionStateMachine {
    committer: Box<dyn TransactionCommitter>,
    lock_token: LockTokenHandle,
    storage: Box<dyn StateStorage<TransactionState>>,
    state: TransactionState,
}

impl TransactionStateMachine {
    pub fn new(
        committer: Box<dyn TransactionCommitter>,
        lock_token: LockTokenHandle,
        storage: Box<dyn StateStorage<TransactionState>>,
    ) -> Self {
        TransactionStateMachine {
            committer,
            lock_token,
            storage,
            state: TransactionState::default(),
        }
    }
}

impl StateMachine for TransactionStateMachine {
    fn kind(&self) -> StateKind {
        StateKind::Transaction
    }

    fn start(&mut self) -> Result<(), StateMachineError> {
        let mut state = self.storage.initial_state()?;
        state.last_committed_index = state
            .last_committed_index
            .max(self.committer.last_committed_index());
        self.state = state;
        Ok(())
    }

    fn apply(&mut self, content: &OperationContent, index: u64) -> Result<OperationOutcome, StateMachineError> {
        let request = match content {
            OperationContent::Transaction(request) => request,
            other => return Err(unexpected(self.kind(), other)),
        };
        if index as i64 <= self.state.last_committed_index {
            return Ok(OperationOutcome::AlreadyApplied);
        }
        let current = self.lock_token.token_id();
        if request.lock_session_id != current {
            self.state.last_committed_index = index as i64;
            return Ok(OperationOutcome::Rejected {
                reason: format!(
                    "Lock session {} expired, current token is {}",
                    request.lock_session_id, current
                ),
            });
        }

        let tx_id = self
            .committer
            .commit(request, index)
            .map_err(|reason| StateMachineError::Commit { index, reason })?;
        self.state.last_committed_index = index as i64;
        Ok(OperationOutcome::Committed { tx_id })
    }

    fn batch_completed(&mut self) -> Result<(), StateMachineError> {
        self.committer
            .batch_completed()
            .map_err(|reason| StateMachineError::Commit {
                index: self.state.last_committed_index.max(0) as u64,
                reason,
            })
    }

    fn flush(&mut self) -> Result<(), StateMachineError> {
        self.committer
            .flush()
            .map_err(|reason| StateMachineError::Commit {
                index: self.state.last_committed_index.max(0) as u64,
                reason,
            })?;
        Ok(self.storage.persist(&self.state)?)
    }

    fn last_applied_index(&self) -> i64 {
        self.state.last_committed_index
    }

    fn add_to_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), StateMachineError> {
        Ok(snapshot.add_state(StateKind::Transaction, &self.state)?)
    }

    fn restore_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StateMachineError> {
        self.state = snapshot.state(StateKind::Transaction)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStateStorage;
    use crate::kernel::machines::{LockTokenState, LockTokenStateMachine};
    use crate::kernel::operation::{LockTokenRequest, MemberId};
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct RecordingCommitter {
        commits: Arc<Mutex<Vec<u64>>>,
        batches: Arc<Mutex<u32>>,
    }

    impl TransactionCommitter for RecordingCommitter {
        fn commit(&mut self, _request: &TransactionRequest, index: u64) -> Result<u64, String> {
            let mut commits = self.commits.lock();
            commits.push(index);
            Ok(commits.len() as u64)
        }

        fn last_committed_index(&self) -> i64 {
            self.commits.lock().last().map_or(NOTHING, |&i| i as i64)
        }

        fn batch_completed(&mut self) -> Result<(), String> {
            *self.batches.lock() += 1;
            Ok(())
        }
    }

    fn tx(lock_session_id: i64) -> OperationContent {
        OperationContent::Transaction(TransactionRequest {
            lock_session_id,
            payload: vec![0xAB],
        })
    }

    #[test]
    fn test_commit_requires_current_lock_token() {
        let mut locks = LockTokenStateMachine::new(Box::new(InMemoryStateStorage::<LockTokenState>::new()));
        let committer = RecordingCommitter::default();
        let mut machine = TransactionStateMachine::new(
            Box::new(committer.clone()),
            locks.handle(),
            Box::new(InMemoryStateStorage::<TransactionState>::new()),
        );

        // No token granted yet.
        assert!(matches!(machine.apply(&tx(0), 0).unwrap(), OperationOutcome::Rejected { .. }));

        locks
            .apply(
                &OperationContent::LockToken(LockTokenRequest {
                    owner: MemberId::random(),
                    candidate_id: 0,
                }),
                1,
            )
            .unwrap();

        assert_eq!(
            machine.apply(&tx(0), 2).unwrap(),
            OperationOutcome::Committed { tx_id: 1 }
        );
        machine.batch_completed().unwrap();

        assert_eq!(*committer.commits.lock(), vec![2]);
        assert_eq!(*committer.batches.lock(), 1);
        assert_eq!(machine.last_applied_index(), 2);
    }

    #[test]
    fn test_committer_failure_is_fatal() {
        struct Failing;
        impl TransactionCommitter for Failing {
            fn commit(&mut self, _: &TransactionRequest, _: u64) -> Result<u64, String> {
                Err("disk full".into())
            }

            fn last_committed_index(&self) -> i64 {
                NOTHING
            }
        }

        let locks = LockTokenStateMachine::new(Box::new(InMemoryStateStorage::<LockTokenState>::new()));
        let mut machine = TransactionStateMachine::new(
            Box::new(Failing),
            locks.handle(),
            Box::new(InMemoryStateStorage::<TransactionState>::new()),
        );
        let err = machine.apply(&tx(NOTHING), 7).unwrap_err();
        assert!(matches!(err, StateMachineError::Commit { index: 7, .. }));
        assert_eq!(machine.last_applied_index(), NOTHING);
    }

    #[test]
    fn test_start_skips_commits_already_durable() {
        let locks = LockTokenStateMachine::new(Box::new(InMemoryStateStorage::<LockTokenState>::new()));
        let committer = RecordingCommitter::default();
        committer.commits.lock().extend([3, 5]);
        let mut machine = TransactionStateMachine::new(
            Box::new(committer.clone()),
            locks.handle(),
            Box::new(InMemoryStateStorage::with_state(TransactionState {
                last_committed_index: 2,
            })),
        );
        machine.start().unwrap();

        assert_eq!(machine.last_applied_index(), 5);
        assert_eq!(machine.apply(&tx(NOTHING), 5).unwrap(), OperationOutcome::AlreadyApplied);
        assert_eq!(*committer.commits.lock(), vec![3, 5]);
    }
}
