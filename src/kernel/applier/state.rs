//! State shared between the apply thread and everyone who notifies it.
//!
//! # Visibility Contract
//!
//! - `last_seen_commit_index` only moves forward
//! - `panicked` never reverts
//! - The apply thread blocks only in `await_job`
//! - `last_applied` / `last_flushed` are published by the apply thread for
//!   observers; the authoritative values live in the apply core

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::engine::log::NOTHING;

#[derive(Debug)]
struct ApplierState {
    last_seen_commit_index: i64,
    keep_running: bool,
    panicked: bool,
}

#[derive(Debug)]
pub struct ApplierShared {
    state: Mutex<ApplierState>,
    job_available: Condvar,
    last_applied: AtomicI64,
    last_flushed: AtomicI64,
}

impl ApplierShared {
    pub fn new() -> Self {
        ApplierShared {
            state: Mutex::new(ApplierState {
                last_seen_commit_index: NOTHING,
                keep_running: false,
                panicked: false,
            }),
            job_available: Condvar::new(),
            last_applied: AtomicI64::new(NOTHING),
            last_flushed: AtomicI64::new(NOTHING),
        }
    }

    /// Raise the commit index seen by the applier. Lower values are ignored.
    pub fn notify_committed(&self, index: i64) {
        let mut state = self.state.lock();
        if index > state.last_seen_commit_index {
            state.last_seen_commit_index = index;
            self.job_available.notify_all();
        }
    }

    /// Block until there is something past `last_applied` to apply.
    ///
    /// Returns the commit index to apply up to, or `None` once the thread
    /// should exit.
    pub fn await_job(&self, last_applied: i64) -> Option<i64> {
        let mut state = self.state.lock();
        while state.keep_running && !state.panicked && last_applied >= state.last_seen_commit_index {
            self.job_available.wait(&mut state);
        }
        if state.keep_running && !state.panicked {
            Some(state.last_seen_commit_index)
        } else {
            None
        }
    }

    pub fn set_keep_running(&self, keep_running: bool) {
        let mut state = self.state.lock();
        state.keep_running = keep_running;
        self.job_available.notify_all();
    }

    pub fn keep_running(&self) -> bool {
        let state = self.state.lock();
        state.keep_running && !state.panicked
    }

    /// Enter the terminal panicked state.
    pub fn panic(&self) {
        let mut state = self.state.lock();
        state.panicked = true;
        state.keep_running = false;
        self.job_available.notify_all();
    }

    pub fn is_panicked(&self) -> bool {
        self.state.lock().panicked
    }

    pub fn last_seen_commit_index(&self) -> i64 {
        self.state.lock().last_seen_commit_index
    }

    pub(crate) fn publish_applied(&self, index: i64) {
        self.last_applied.store(index, Ordering::Release);
    }

    pub(crate) fn publish_flushed(&self, index: i64) {
        self.last_flushed.store(index, Ordering::Release);
    }

    pub fn last_applied(&self) -> i64 {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn last_flushed(&self) -> i64 {
        self.last_flushed.load(Ordering::Acquire)
    }
}

impl Default for ApplierShared {
    fn default() -> Self {
        Self::new()
    }
}
