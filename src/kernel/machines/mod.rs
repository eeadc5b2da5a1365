//! Pluggable business state machines.
//!
//! Each machine owns exactly one `StateKind`, receives the operation content
//! routed to it by the hub, and must tolerate replay: an index at or below
//! its own `last_applied_index` is acknowledged without changing state.
//!
//! Deterministic business rejections are NOT errors; they come back as
//! `OperationOutcome::Rejected`. An `Err` from `apply` or `flush` is fatal
//! for the applier.

mod dummy;
mod id_allocation;
mod lock_token;
mod token;
mod transaction;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::errors::StorageError;
use crate::kernel::operation::{IdType, OperationContent};
use crate::kernel::snapshot::{Snapshot, SnapshotError, StateKind};

pub use dummy::{DummyState, DummyStateMachine};
pub use id_allocation::{IdAllocationState, IdAllocationStateMachine};
pub use lock_token::{LockTokenHandle, LockTokenState, LockTokenStateMachine};
pub use token::{TokenRegistry, TokenStateMachine};
pub use transaction::{TransactionCommitter, TransactionState, TransactionStateMachine};

/// Result delivered to the client that submitted an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOutcome {
    /// An id range was granted.
    IdRange { id_type: IdType, start: u64, length: u32 },
    /// The lock token moved to the requesting member.
    LockAcquired { token_id: u64 },
    /// Id of the requested token.
    Token { id: u32 },
    /// The transaction was committed by the storage engine.
    Committed { tx_id: u64 },
    /// The machine acknowledged the operation with nothing to return.
    Done,
    /// The operation was at or below the machine's applied index.
    AlreadyApplied,
    /// Deterministic business rejection.
    Rejected { reason: String },
}

/// Fatal state machine failure.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("State storage: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("No state machine registered for {0:?}")]
    NoMachine(StateKind),

    #[error("{kind:?} state machine cannot apply {content:?} content")]
    UnexpectedContent {
        kind: StateKind,
        content: crate::kernel::operation::ContentType,
    },

    #[error("Transaction commit failed at index {index}: {reason}")]
    Commit { index: u64, reason: String },
}

/// Capability contract every business state machine implements.
pub trait StateMachine: Send {
    /// The single snapshot tag this machine owns.
    fn kind(&self) -> StateKind;

    /// Load persisted state. Called once before any apply.
    fn start(&mut self) -> Result<(), StateMachineError> {
        Ok(())
    }

    /// Apply `content` committed at `index`.
    fn apply(&mut self, content: &OperationContent, index: u64) -> Result<OperationOutcome, StateMachineError>;

    /// Called when the dispatcher for a batch is closed.
    fn batch_completed(&mut self) -> Result<(), StateMachineError> {
        Ok(())
    }

    /// Durably persist everything applied so far.
    fn flush(&mut self) -> Result<(), StateMachineError>;

    /// Highest index whose effects are reflected in this machine.
    fn last_applied_index(&self) -> i64;

    fn add_to_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), StateMachineError>;

    fn restore_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StateMachineError>;
}

fn unexpected(kind: StateKind, content: &OperationContent) -> StateMachineError {
    StateMachineError::UnexpectedContent {
        kind,
        content: content.content_type(),
    }
}
