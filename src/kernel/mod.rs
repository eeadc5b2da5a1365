//! Kernel module: deterministic application of the committed log.
//!
//! The kernel sits on top of the engine and provides:
//! - At-most-once delivery of client operations (session tracking)
//! - Batched dispatch to pluggable state machines
//! - The single-threaded apply loop with counted pause/resume
//! - Panic handling (terminal, reported through the health signal)
//! - Consistent snapshots across every state machine

pub mod applier;
pub mod batcher;
pub mod coordinator;
pub mod health;
pub mod hub;
pub mod machines;
pub mod operation;
pub mod progress;
pub mod session;
pub mod snapshot;

pub use applier::{Applier, ApplierError, ApplyError, FlushedIndex};
pub use batcher::CommandBatcher;
pub use coordinator::{CoordinatorError, SnapshotCoordinator};
pub use health::{DatabaseHealth, HealthSignal};
pub use hub::{CommandDispatcher, StateMachineHub};
pub use machines::{OperationOutcome, StateMachine, StateMachineError};
pub use operation::{DistributedOperation, GlobalSession, LocalOperationId, MemberId, OperationContent};
pub use progress::{Progress, ProgressTracker};
pub use session::{SessionTracker, SessionTrackerState};
pub use snapshot::{Snapshot, SnapshotError, StateKind};
