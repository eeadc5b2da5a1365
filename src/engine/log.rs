//! Replicated log contract and an in-memory reference log.
//!
//! The log itself belongs to the consensus engine. The applier only needs
//! sequential cursors, the term of a given index, and the two compaction
//! hooks (`skip` on snapshot install, `prune` after a durable flush).
//!
//! # Index conventions
//!
//! Indices are `i64` with `-1` meaning "nothing": an empty log has
//! `append_index() == -1` and `prev_index() == -1`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::errors::LogError;
use crate::kernel::operation::{DistributedOperation, MemberId};

/// Index/term sentinel for "no entry".
pub const NOTHING: i64 = -1;

// =============================================================================
// LOG ENTRY
// =============================================================================

/// Content carried by a log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatedContent {
    /// A client operation, subject to session deduplication and batching.
    Operation(DistributedOperation),
    /// Appended by a new leader; carries no state change.
    NewLeaderBarrier,
    /// Membership change, owned by the consensus engine.
    MemberSet(Vec<MemberId>),
}

/// An entry of the replicated log. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log.
    pub index: u64,
    /// Consensus term in which the entry was appended.
    pub term: u64,
    /// Entry payload.
    pub content: ReplicatedContent,
}

impl LogEntry {
    /// Create a new entry.
    pub fn new(index: u64, term: u64, content: ReplicatedContent) -> Self {
        LogEntry { index, term, content }
    }
}

// =============================================================================
// LOG CONTRACT
// =============================================================================

/// A sequential read cursor over the log.
pub trait EntryCursor: Send {
    /// Next entry, or `None` once the cursor passed the append index.
    fn next(&mut self) -> Result<Option<LogEntry>, LogError>;
}

/// Durable, append-only log of `(index, term, content)` entries.
pub trait ReplicatedLog: Send + Sync {
    /// Index of the last appended entry (`NOTHING` when empty).
    fn append_index(&self) -> i64;

    /// Index immediately before the first retained entry.
    fn prev_index(&self) -> i64;

    /// Term of the entry at `index`.
    ///
    /// Returns `NOTHING` for index `NOTHING`, and the prefix term for
    /// `prev_index()` itself.
    fn read_entry_term(&self, index: i64) -> Result<i64, LogError>;

    /// Open a cursor positioned at `from`.
    fn entry_cursor(&self, from: u64) -> Result<Box<dyn EntryCursor>, LogError>;

    /// Drop everything up to `index` and restart the log after it.
    ///
    /// Returns true if entries were actually discarded or the log jumped
    /// forward; false if the log already contains `(index, term)`.
    fn skip(&self, index: i64, term: i64) -> Result<bool, LogError>;

    /// Discard entries up to `safe_index`. Returns the new prev index.
    fn prune(&self, safe_index: i64) -> Result<i64, LogError>;
}

// =============================================================================
// IN-MEMORY LOG
// =============================================================================

#[derive(Debug)]
struct MemoryLogState {
    /// Index immediately before `entries[0]`.
    prev_index: i64,
    /// Term of the entry at `prev_index`.
    prev_term: i64,
    entries: VecDeque<LogEntry>,
}

impl MemoryLogState {
    fn append_index(&self) -> i64 {
        self.prev_index + self.entries.len() as i64
    }

    fn get(&self, index: i64) -> Option<&LogEntry> {
        if index <= self.prev_index {
            return None;
        }
        self.entries.get((index - self.prev_index - 1) as usize)
    }
}

/// Reference `ReplicatedLog` kept entirely in memory.
///
/// Cursors copy entries out under a read lock, so appends never block on a
/// slow reader.
pub struct InMemoryLog {
    state: Arc<RwLock<MemoryLogState>>,
}

impl InMemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        InMemoryLog {
            state: Arc::new(RwLock::new(MemoryLogState {
                prev_index: NOTHING,
                prev_term: NOTHING,
                entries: VecDeque::new(),
            })),
        }
    }

    /// Append content in `term`; returns the entry that was stored.
    pub fn append(&self, term: u64, content: ReplicatedContent) -> LogEntry {
        let mut state = self.state.write();
        let index = (state.append_index() + 1) as u64;
        let entry = LogEntry::new(index, term, content);
        state.entries.push_back(entry.clone());
        entry
    }

    /// Entry at `index`, if retained.
    pub fn get(&self, index: i64) -> Option<LogEntry> {
        self.state.read().get(index).cloned()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedLog for InMemoryLog {
    fn append_index(&self) -> i64 {
        self.state.read().append_index()
    }

    fn prev_index(&self) -> i64 {
        self.state.read().prev_index
    }

    fn read_entry_term(&self, index: i64) -> Result<i64, LogError> {
        let state = self.state.read();
        if index == state.prev_index {
            return Ok(state.prev_term);
        }
        if index < state.prev_index {
            return Err(LogError::Compacted {
                index,
                prev_index: state.prev_index,
            });
        }
        match state.get(index) {
            Some(entry) => Ok(entry.term as i64),
            None => Err(LogError::BeyondAppendIndex {
                index,
                append_index: state.append_index(),
            }),
        }
    }

    fn entry_cursor(&self, from: u64) -> Result<Box<dyn EntryCursor>, LogError> {
        let prev_index = self.state.read().prev_index;
        if (from as i64) <= prev_index {
            return Err(LogError::Compacted {
                index: from as i64,
                prev_index,
            });
        }
        Ok(Box::new(MemoryCursor {
            state: self.state.clone(),
            next_index: from as i64,
        }))
    }

    fn skip(&self, index: i64, term: i64) -> Result<bool, LogError> {
        let mut state = self.state.write();

        if index == state.prev_index && term == state.prev_term {
            return Ok(false);
        }
        if let Some(entry) = state.get(index) {
            if entry.term as i64 == term {
                return Ok(false);
            }
        }
        if index < state.prev_index {
            return Err(LogError::SkipBehindPrefix {
                index,
                prev_index: state.prev_index,
            });
        }

        state.entries.clear();
        state.prev_index = index;
        state.prev_term = term;
        Ok(true)
    }

    fn prune(&self, safe_index: i64) -> Result<i64, LogError> {
        let mut state = self.state.write();
        let upper = safe_index.min(state.append_index());
        while state.prev_index < upper {
            match state.entries.pop_front() {
                Some(entry) => {
                    state.prev_index = entry.index as i64;
                    state.prev_term = entry.term as i64;
                }
                None => break,
            }
        }
        Ok(state.prev_index)
    }
}

struct MemoryCursor {
    state: Arc<RwLock<MemoryLogState>>,
    next_index: i64,
}

impl EntryCursor for MemoryCursor {
    fn next(&mut self) -> Result<Option<LogEntry>, LogError> {
        let state = self.state.read();
        if self.next_index <= state.prev_index {
            return Err(LogError::Compacted {
                index: self.next_index,
                prev_index: state.prev_index,
            });
        }
        let entry = state.get(self.next_index).cloned();
        if entry.is_some() {
            self.next_index += 1;
        }
        Ok(entry)
    }
}
