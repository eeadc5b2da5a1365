//! Replicated-log application engine.
//!
//! Takes a durable, totally ordered log agreed on by a consensus engine and
//! turns it into deterministic local state transitions:
//!
//! - `engine`: log access (replicated log, in-flight cache, sequential reader)
//!   and durable state storage
//! - `kernel`: session deduplication, batching, the apply loop, the state
//!   machine hub and snapshot coordination
//! - `consensus`: glue that turns consensus outcomes into commit
//!   notifications or snapshot downloads
//!
//! # Invariants
//!
//! 1. **Single applier**: exactly one thread applies entries per log.
//! 2. **Monotonic watermarks**: `last_flushed <= last_applied`, and the
//!    commit index seen by the applier never moves backwards.
//! 3. **At-most-once**: a client operation is dispatched at most once, no
//!    matter how often it appears in the log.
//! 4. **Terminal panic**: once the applier panics it never applies again.

pub mod config;
pub mod consensus;
pub mod engine;
pub mod kernel;

pub use config::ApplierConfig;
pub use consensus::{CommitNotifier, ConsensusCoreState, ConsensusEngine, ConsensusOutcome};
pub use engine::{
    ConsecutiveInFlightCache, FileStateStorage, InFlightCache, InMemoryLog, InMemoryStateStorage,
    LogEntry, LogEntryReader, ReplicatedContent, ReplicatedLog, StateStorage,
};
pub use kernel::{
    Applier, CommandBatcher, CommandDispatcher, DatabaseHealth, DistributedOperation,
    HealthSignal, OperationContent, OperationOutcome, ProgressTracker, SessionTracker, Snapshot,
    SnapshotCoordinator, StateKind, StateMachine, StateMachineHub,
};
