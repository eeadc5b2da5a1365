//! Applier error types.

use std::io;

use thiserror::Error;

use crate::engine::errors::{ReadError, StorageError};
use crate::kernel::machines::StateMachineError;

/// Anything that stops an apply pass. Always fatal for the applier.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A committed entry could not be read.
    #[error("Read failed: {0}")]
    Read(#[from] ReadError),

    /// An operation was added to a batch out of order.
    #[error("Non-contiguous batch add: expected index {expected}, got {actual}")]
    NonContiguous { expected: u64, actual: u64 },

    /// A state machine failed to apply an operation.
    #[error("Dispatch failed at index {index}: {source}")]
    Dispatch {
        index: u64,
        #[source]
        source: StateMachineError,
    },

    /// Flushing state machines failed.
    #[error("Flush failed: {0}")]
    Flush(#[source] StateMachineError),

    /// The flush watermark could not be persisted.
    #[error("Flush watermark: {0}")]
    Storage(#[from] StorageError),

    /// A Rust panic unwound out of the apply pass.
    #[error("Apply pass poisoned after index {last_applied}: {message}")]
    Poisoned { last_applied: i64, message: String },
}

/// Misuse of the applier lifecycle, or a failure surfaced through it.
#[derive(Debug, Error)]
pub enum ApplierError {
    /// `resume` without a matching `pause`.
    #[error("Unmatched resume ({reason}): applier is not paused")]
    UnmatchedResume { reason: String },

    /// The applier has panicked; it accepts no further lifecycle calls.
    #[error("Applier has panicked ({reason})")]
    Panicked { reason: String },

    /// The apply state was lost with a worker thread that died outside the
    /// apply pass.
    #[error("Apply worker lost")]
    WorkerLost,

    #[error("Failed to spawn apply worker: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("Startup: {0}")]
    Startup(#[from] StateMachineError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
