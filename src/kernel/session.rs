//! Session tracker: at-most-once application of client operations.
//!
//! Every member owns one global session at a time and numbers its
//! operations per local session. An operation is applied only if it is
//! exactly the next one expected for its local session; anything else is a
//! retry (or reordering) and is skipped.
//!
//! # Acceptance rules
//!
//! - Unknown owner, or an owner whose recorded global session differs:
//!   only sequence number 0 is accepted
//! - Known global session, unknown local session: only 0 is accepted
//! - Known local session: only `last + 1` is accepted

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::errors::StorageError;
use crate::engine::log::NOTHING;
use crate::engine::storage::StateStorage;
use crate::kernel::operation::{GlobalSession, LocalOperationId, MemberId};

/// Per-owner progress within its current global session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSessionTracker {
    global_session_id: Uuid,
    /// local_session_id -> last applied sequence number.
    last_sequence_numbers: HashMap<u64, u64>,
}

impl LocalSessionTracker {
    fn new(global_session_id: Uuid) -> Self {
        LocalSessionTracker {
            global_session_id,
            last_sequence_numbers: HashMap::new(),
        }
    }

    fn is_valid(&self, operation_id: &LocalOperationId) -> bool {
        match self.last_sequence_numbers.get(&operation_id.local_session_id) {
            None => operation_id.sequence_number == 0,
            Some(&last) => Some(operation_id.sequence_number) == last.checked_add(1),
        }
    }

    fn record(&mut self, operation_id: &LocalOperationId) {
        self.last_sequence_numbers
            .insert(operation_id.local_session_id, operation_id.sequence_number);
    }
}

/// Full tracker table, the unit of persistence and snapshotting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTrackerState {
    session_trackers: HashMap<MemberId, LocalSessionTracker>,
    /// Log index of the last recorded update.
    log_index: i64,
}

impl Default for SessionTrackerState {
    fn default() -> Self {
        SessionTrackerState {
            session_trackers: HashMap::new(),
            log_index: NOTHING,
        }
    }
}

impl SessionTrackerState {
    pub fn log_index(&self) -> i64 {
        self.log_index
    }

    pub fn validate_operation(&self, session: &GlobalSession, operation_id: &LocalOperationId) -> bool {
        match self.session_trackers.get(&session.owner) {
            Some(tracker) if tracker.global_session_id == session.session_id => {
                tracker.is_valid(operation_id)
            }
            _ => operation_id.sequence_number == 0,
        }
    }

    pub fn update(&mut self, session: &GlobalSession, operation_id: &LocalOperationId, log_index: u64) {
        let tracker = self
            .session_trackers
            .entry(session.owner)
            .or_insert_with(|| LocalSessionTracker::new(session.session_id));
        if tracker.global_session_id != session.session_id {
            *tracker = LocalSessionTracker::new(session.session_id);
        }
        tracker.record(operation_id);
        self.log_index = log_index as i64;
    }
}

/// Durable session tracker driven by the apply thread.
pub struct SessionTracker {
    storage: Box<dyn StateStorage<SessionTrackerState>>,
    state: SessionTrackerState,
    loaded: bool,
}

impl SessionTracker {
    pub fn new(storage: Box<dyn StateStorage<SessionTrackerState>>) -> Self {
        SessionTracker {
            storage,
            state: SessionTrackerState::default(),
            loaded: false,
        }
    }

    /// Load the persisted table. A no-op if already loaded (or installed).
    pub fn start(&mut self) -> Result<(), StorageError> {
        if !self.loaded {
            self.state = self.storage.initial_state()?;
            self.loaded = true;
        }
        Ok(())
    }

    /// True iff `operation_id` is the next expected id for `session`.
    pub fn validate_operation(&self, session: &GlobalSession, operation_id: &LocalOperationId) -> bool {
        self.state.validate_operation(session, operation_id)
    }

    /// Record a dispatched operation at `log_index`.
    pub fn update(&mut self, session: &GlobalSession, operation_id: &LocalOperationId, log_index: u64) {
        self.state.update(session, operation_id, log_index);
    }

    pub fn last_applied_index(&self) -> i64 {
        self.state.log_index
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.storage.persist(&self.state)
    }

    pub fn snapshot(&self) -> SessionTrackerState {
        self.state.clone()
    }

    pub fn install_snapshot(&mut self, state: SessionTrackerState) {
        self.state = state;
        self.loaded = true;
    }
}
