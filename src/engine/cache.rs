//! In-flight cache: recently appended entries kept in memory so the applier
//! rarely has to open a log cursor.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::engine::log::LogEntry;

/// Bounded cache of recently appended log entries.
///
/// Shared between the append path (which `put`s) and the applier (which
/// `get`s and `prune`s), hence `&self` everywhere.
pub trait InFlightCache: Send + Sync {
    /// Cache an appended entry.
    fn put(&self, entry: LogEntry);

    /// Entry at `index`, if still cached.
    fn get(&self, index: u64) -> Option<LogEntry>;

    /// Drop every entry with index <= `up_to`.
    fn prune(&self, up_to: u64);

    /// Drop every entry with index >= `from` (log truncation).
    fn truncate(&self, from: u64);

    /// Number of cached entries.
    fn len(&self) -> usize;

    /// True if nothing is cached.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache holding one contiguous run of indices.
///
/// A `put` that does not extend the run clears the cache first; when full
/// the oldest entries are evicted. Eviction order is therefore FIFO, which
/// is why a reader that misses once must not trust the cache again.
pub struct ConsecutiveInFlightCache {
    max_entries: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl ConsecutiveInFlightCache {
    /// Create a cache bounded to `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        ConsecutiveInFlightCache {
            max_entries: max_entries.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn first_index(entries: &VecDeque<LogEntry>) -> Option<u64> {
        entries.front().map(|e| e.index)
    }
}

impl InFlightCache for ConsecutiveInFlightCache {
    fn put(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();

        let extends_run = match entries.back() {
            Some(last) => entry.index == last.index + 1,
            None => true,
        };
        if !extends_run {
            entries.clear();
        }

        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    fn get(&self, index: u64) -> Option<LogEntry> {
        let entries = self.entries.lock();
        let first = Self::first_index(&entries)?;
        if index < first {
            return None;
        }
        entries.get((index - first) as usize).cloned()
    }

    fn prune(&self, up_to: u64) {
        let mut entries = self.entries.lock();
        while matches!(entries.front(), Some(e) if e.index <= up_to) {
            entries.pop_front();
        }
    }

    fn truncate(&self, from: u64) {
        let mut entries = self.entries.lock();
        while matches!(entries.back(), Some(e) if e.index >= from) {
            entries.pop_back();
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
