//! Commit notifier: feeds consensus messages to the engine and forwards the
//! outcome to the applier.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::kernel::applier::Applier;
use crate::kernel::health::HealthSignal;

use super::download::SnapshotDownloadService;
use super::{ConsensusEngine, ConsensusError, ConsensusOutcome};

#[derive(Debug, Error)]
pub enum NotifierError {
    /// The engine failed; the replica has been taken offline.
    #[error("Consensus failure: {0}")]
    Consensus(#[from] ConsensusError),
}

pub struct CommitNotifier<E: ConsensusEngine> {
    engine: Arc<E>,
    applier: Arc<Applier>,
    downloads: Arc<SnapshotDownloadService>,
    health: Arc<dyn HealthSignal>,
    /// Serializes message handling.
    lock: Mutex<()>,
}

impl<E: ConsensusEngine> CommitNotifier<E> {
    pub fn new(
        engine: Arc<E>,
        applier: Arc<Applier>,
        downloads: Arc<SnapshotDownloadService>,
        health: Arc<dyn HealthSignal>,
    ) -> Self {
        CommitNotifier {
            engine,
            applier,
            downloads,
            health,
            lock: Mutex::new(()),
        }
    }

    /// Handle one message. An engine error is fatal for this replica.
    pub fn handle(&self, message: E::Message) -> Result<(), NotifierError> {
        let _guard = self.lock.lock();
        match self.engine.handle(message) {
            Ok(outcome) => {
                self.apply_outcome(outcome);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to process consensus message");
                self.engine.panic();
                self.health.panic(&format!("Consensus failure: {}", e));
                Err(e.into())
            }
        }
    }

    fn apply_outcome(&self, outcome: ConsensusOutcome) {
        if !outcome.needs_fresh_snapshot {
            self.applier.notify_committed(outcome.commit_index);
            return;
        }

        match self.downloads.schedule_download() {
            Some(job) => {
                if let Err(e) = job.wait() {
                    warn!(error = %e, "Snapshot download job failed");
                }
            }
            None => debug!("Snapshot download already in progress"),
        }
    }
}
