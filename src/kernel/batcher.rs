//! Command batcher: groups contiguous operations before dispatch.
//!
//! The flush target runs synchronously on the caller's thread, so the apply
//! loop can never read further ahead than dispatch has caught up.

use crate::kernel::applier::ApplyError;
use crate::kernel::operation::DistributedOperation;

/// Consumer of a full (or forced) batch.
pub trait ApplyBatch {
    /// Apply `batch`, whose last operation sits at log index `last_index`.
    fn apply_batch(&mut self, last_index: u64, batch: &[DistributedOperation]) -> Result<(), ApplyError>;
}

/// Bounded batch of operations at consecutive log indices.
pub struct CommandBatcher {
    max_batch_size: usize,
    batch: Vec<DistributedOperation>,
    /// Log index of the last operation added to `batch`.
    last_index: u64,
}

impl CommandBatcher {
    pub fn new(max_batch_size: usize) -> Self {
        let max_batch_size = max_batch_size.max(1);
        CommandBatcher {
            max_batch_size,
            batch: Vec::with_capacity(max_batch_size),
            last_index: 0,
        }
    }

    /// Append `operation` at `index`; flushes into `target` once full.
    ///
    /// Within a batch indices must be consecutive.
    pub fn add(
        &mut self,
        index: u64,
        operation: DistributedOperation,
        target: &mut dyn ApplyBatch,
    ) -> Result<(), ApplyError> {
        if !self.batch.is_empty() && index != self.last_index + 1 {
            return Err(ApplyError::NonContiguous {
                expected: self.last_index + 1,
                actual: index,
            });
        }

        self.batch.push(operation);
        self.last_index = index;

        if self.batch.len() >= self.max_batch_size {
            self.flush(target)?;
        }
        Ok(())
    }

    /// Hand the pending batch to `target`. No-op when empty.
    pub fn flush(&mut self, target: &mut dyn ApplyBatch) -> Result<(), ApplyError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let result = target.apply_batch(self.last_index, &self.batch);
        self.batch.clear();
        result
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Drop pending operations without applying them.
    pub fn clear(&mut self) {
        self.batch.clear();
    }
}
