//! Sequential entry reader for the apply loop.
//!
//! # Access Contract
//!
//! - `get` MUST be called with strictly increasing indices by a single caller
//! - The in-flight cache is consulted until the first miss; from then on the
//!   reader stays on a log cursor for the rest of its life
//! - A committed index that cannot be read is fatal (`ReadError::MissingEntry`)
//!
//! A fresh reader is created for every apply pass, so a reader that fell back
//! to the cursor during catch-up does not stay slow forever.

use std::sync::Arc;

use crate::engine::cache::InFlightCache;
use crate::engine::errors::ReadError;
use crate::engine::log::{EntryCursor, LogEntry, ReplicatedLog};

pub struct LogEntryReader {
    log: Arc<dyn ReplicatedLog>,
    cache: Arc<dyn InFlightCache>,
    prune_after_read: bool,
    /// Set at the first cache miss; never cleared.
    use_cache: bool,
    cursor: Option<Box<dyn EntryCursor>>,
    /// Index of the last entry returned by the cursor.
    cursor_index: Option<u64>,
    last_read: Option<u64>,
}

impl LogEntryReader {
    pub fn new(
        log: Arc<dyn ReplicatedLog>,
        cache: Arc<dyn InFlightCache>,
        prune_after_read: bool,
    ) -> Self {
        LogEntryReader {
            log,
            cache,
            prune_after_read,
            use_cache: true,
            cursor: None,
            cursor_index: None,
            last_read: None,
        }
    }

    /// Read the entry at `index`.
    pub fn get(&mut self, index: u64) -> Result<LogEntry, ReadError> {
        if let Some(last_read) = self.last_read {
            if index <= last_read {
                return Err(ReadError::NotIncreasing {
                    requested: index,
                    last_read,
                });
            }
        }

        let entry = match self.from_cache(index) {
            Some(entry) => entry,
            None => self.from_cursor(index)?,
        };

        if self.prune_after_read {
            self.cache.prune(index);
        }
        self.last_read = Some(index);
        Ok(entry)
    }

    /// True once the reader has fallen back to cursor scanning.
    pub fn is_cursor_mode(&self) -> bool {
        !self.use_cache
    }

    fn from_cache(&mut self, index: u64) -> Option<LogEntry> {
        if !self.use_cache {
            return None;
        }
        match self.cache.get(index) {
            Some(entry) => Some(entry),
            None => {
                self.use_cache = false;
                None
            }
        }
    }

    fn from_cursor(&mut self, index: u64) -> Result<LogEntry, ReadError> {
        // Reposition unless the cursor is parked right before `index`.
        let positioned = matches!(self.cursor_index, Some(last) if last + 1 == index);
        if self.cursor.is_none() || !positioned {
            self.cursor = Some(self.log.entry_cursor(index)?);
            self.cursor_index = index.checked_sub(1);
        }

        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => return Err(ReadError::MissingEntry { index }),
        };

        match cursor.next()? {
            Some(entry) if entry.index == index => {
                self.cursor_index = Some(index);
                Ok(entry)
            }
            _ => {
                self.cursor = None;
                self.cursor_index = None;
                Err(ReadError::MissingEntry { index })
            }
        }
    }
}
