//! The apply core: everything the apply thread owns.
//!
//! The core moves into the apply thread while the applier runs and comes
//! back out when it is paused, so exactly one party can touch the state
//! machines at any time without locking them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ApplierConfig;
use crate::engine::cache::InFlightCache;
use crate::engine::errors::StorageError;
use crate::engine::log::{ReplicatedContent, ReplicatedLog, NOTHING};
use crate::engine::reader::LogEntryReader;
use crate::engine::storage::StateStorage;
use crate::kernel::batcher::{ApplyBatch, CommandBatcher};
use crate::kernel::hub::StateMachineHub;
use crate::kernel::operation::DistributedOperation;
use crate::kernel::progress::ProgressTracker;

use super::error::{ApplierError, ApplyError};
use super::state::ApplierShared;

/// Persisted flush watermark.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushedIndex(pub i64);

impl Default for FlushedIndex {
    fn default() -> Self {
        FlushedIndex(NOTHING)
    }
}

// =============================================================================
// DISPATCH STAGE
// =============================================================================

/// Batch target: deduplicates, dispatches, and keeps the watermarks.
pub struct DispatchStage {
    hub: StateMachineHub,
    progress: Arc<ProgressTracker>,
    shared: Arc<ApplierShared>,
    flushed_storage: Box<dyn StateStorage<FlushedIndex>>,
    flush_every: i64,
    last_applied: i64,
    last_flushed: i64,
}

impl DispatchStage {
    fn set_last_applied(&mut self, index: i64) {
        self.last_applied = index;
        self.shared.publish_applied(index);
    }

    fn set_last_flushed(&mut self, index: i64) -> Result<(), StorageError> {
        self.flushed_storage.persist(&FlushedIndex(index))?;
        self.last_flushed = index;
        self.shared.publish_flushed(index);
        Ok(())
    }

    /// Flush every state machine, then persist `last_flushed`.
    fn flush(&mut self) -> Result<(), ApplyError> {
        self.hub.flush().map_err(ApplyError::Flush)?;
        self.set_last_flushed(self.last_applied)?;
        debug!(last_flushed = self.last_flushed, "Flushed state machines");
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<(), ApplyError> {
        if self.last_applied - self.last_flushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn handle_operations(&mut self, first_index: u64, batch: &[DistributedOperation]) -> Result<(), ApplyError> {
        let progress = &self.progress;
        let (mut dispatcher, sessions) = self.hub.dispatch_scope();

        let mut index = first_index;
        for operation in batch {
            if sessions.validate_operation(&operation.global_session, &operation.operation_id) {
                dispatcher
                    .dispatch(&operation.content, index, |outcome| {
                        progress.track_result(operation, outcome)
                    })
                    .map_err(|source| ApplyError::Dispatch { index, source })?;
                sessions.update(&operation.global_session, &operation.operation_id, index);
            } else {
                debug!(
                    index,
                    owner = %operation.global_session.owner,
                    local_session = operation.operation_id.local_session_id,
                    sequence = operation.operation_id.sequence_number,
                    "Skipping duplicate operation"
                );
            }
            index += 1;
        }

        let last_index = index.saturating_sub(1);
        dispatcher
            .close()
            .map_err(|source| ApplyError::Dispatch {
                index: last_index,
                source,
            })
    }
}

impl ApplyBatch for DispatchStage {
    fn apply_batch(&mut self, last_index: u64, batch: &[DistributedOperation]) -> Result<(), ApplyError> {
        let first_index = last_index + 1 - batch.len() as u64;
        self.handle_operations(first_index, batch)?;
        self.set_last_applied(last_index as i64);
        self.maybe_flush()
    }
}

// =============================================================================
// APPLY CORE
// =============================================================================

pub struct ApplyCore {
    log: Arc<dyn ReplicatedLog>,
    cache: Arc<dyn InFlightCache>,
    prune_cache_after_read: bool,
    batcher: CommandBatcher,
    stage: DispatchStage,
}

impl ApplyCore {
    pub(crate) fn new(
        log: Arc<dyn ReplicatedLog>,
        cache: Arc<dyn InFlightCache>,
        hub: StateMachineHub,
        progress: Arc<ProgressTracker>,
        flushed_storage: Box<dyn StateStorage<FlushedIndex>>,
        shared: Arc<ApplierShared>,
        config: &ApplierConfig,
    ) -> Self {
        ApplyCore {
            log,
            cache,
            prune_cache_after_read: config.prune_cache_after_read,
            batcher: CommandBatcher::new(config.max_batch_size),
            stage: DispatchStage {
                hub,
                progress,
                shared,
                flushed_storage,
                flush_every: config.flush_every,
                last_applied: NOTHING,
                last_flushed: NOTHING,
            },
        }
    }

    pub fn last_applied(&self) -> i64 {
        self.stage.last_applied
    }

    pub fn last_flushed(&self) -> i64 {
        self.stage.last_flushed
    }

    pub fn hub(&self) -> &StateMachineHub {
        &self.stage.hub
    }

    pub fn hub_mut(&mut self) -> &mut StateMachineHub {
        &mut self.stage.hub
    }

    pub fn log(&self) -> &Arc<dyn ReplicatedLog> {
        &self.log
    }

    pub fn cache(&self) -> &Arc<dyn InFlightCache> {
        &self.cache
    }

    /// Restore watermarks and load every state owner.
    ///
    /// `last_flushed` is read from storage only if nothing set it in memory
    /// (a snapshot install, or a previous start).
    pub(crate) fn restore(&mut self) -> Result<(), ApplierError> {
        if self.stage.last_flushed == NOTHING {
            let FlushedIndex(flushed) = self.stage.flushed_storage.initial_state()?;
            self.stage.last_flushed = flushed;
            self.stage.shared.publish_flushed(flushed);
        }
        let flushed = self.stage.last_flushed;
        self.stage.set_last_applied(flushed);
        self.stage.hub.start().map_err(ApplierError::Startup)?;
        Ok(())
    }

    /// Apply every entry in `(last_applied, target]`.
    ///
    /// Stops early, between entries, once `shared` says to stop. Any error
    /// leaves the core in an undefined state; the caller must panic the
    /// applier.
    pub(crate) fn apply_up_to(&mut self, target: i64, shared: &ApplierShared) -> Result<(), ApplyError> {
        let mut reader = LogEntryReader::new(
            self.log.clone(),
            self.cache.clone(),
            self.prune_cache_after_read,
        );

        let mut index = self.stage.last_applied + 1;
        while index <= target && shared.keep_running() {
            let entry = reader.get(index as u64)?;
            match entry.content {
                ReplicatedContent::Operation(operation) => {
                    self.stage.progress.track_replication(&operation);
                    self.batcher.add(entry.index, operation, &mut self.stage)?;
                }
                _ => {
                    self.batcher.flush(&mut self.stage)?;
                    self.stage.set_last_applied(index);
                    self.stage.maybe_flush()?;
                }
            }
            index += 1;
        }

        self.batcher.flush(&mut self.stage)
    }

    /// Unconditional flush, used at shutdown.
    pub(crate) fn flush(&mut self) -> Result<(), ApplyError> {
        self.batcher.flush(&mut self.stage)?;
        self.stage.flush()
    }

    /// Treat `index` as applied and flushed (after a snapshot install).
    pub(crate) fn fast_forward(&mut self, index: i64) -> Result<(), StorageError> {
        self.batcher.clear();
        self.stage.set_last_applied(index);
        self.stage.set_last_flushed(index)
    }
}
