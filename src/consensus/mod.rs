//! Consensus glue.
//!
//! The consensus algorithm itself is external. This module defines what the
//! applier needs from it (`ConsensusEngine`, `ConsensusCoreState`) and the
//! two pieces that turn its outcomes into local work: the commit notifier
//! and the snapshot download service.

mod download;
mod notifier;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::kernel::snapshot::SnapshotError;

pub use download::{DownloadError, DownloadJob, SnapshotDownloadService, SnapshotDownloader};
pub use notifier::{CommitNotifier, NotifierError};

/// Errors reported by the external consensus engine.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Consensus engine: {0}")]
    Engine(String),

    #[error("Consensus core state: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Result of feeding one message to the consensus engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsensusOutcome {
    /// Highest index the engine now considers committed.
    pub commit_index: i64,
    /// The local log is too far behind; fetch a snapshot instead.
    pub needs_fresh_snapshot: bool,
}

impl ConsensusOutcome {
    pub fn committed(commit_index: i64) -> Self {
        ConsensusOutcome {
            commit_index,
            needs_fresh_snapshot: false,
        }
    }

    pub fn needs_snapshot(commit_index: i64) -> Self {
        ConsensusOutcome {
            commit_index,
            needs_fresh_snapshot: true,
        }
    }
}

/// The engine's own durable state (term, vote, membership), carried in
/// snapshots next to the state machines.
pub trait ConsensusCoreState: Send + Sync {
    fn core_state(&self) -> Result<Vec<u8>, ConsensusError>;

    fn install_core_state(&self, bytes: &[u8]) -> Result<(), ConsensusError>;
}

/// External consensus engine.
pub trait ConsensusEngine: Send + Sync {
    type Message: Send;

    /// Process one inbound message.
    fn handle(&self, message: Self::Message) -> Result<ConsensusOutcome, ConsensusError>;

    /// Stop participating; called after an unrecoverable failure.
    fn panic(&self);
}
