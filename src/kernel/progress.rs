//! Progress tracking for operations submitted by the local member.
//!
//! A client that replicates an operation registers it with `start` and then
//! waits on the returned `Progress`. The apply thread reports two
//! milestones: the operation was read back from the committed log
//! (`track_replication`), and it was dispatched and produced an outcome
//! (`track_result`). Operations from other global sessions are ignored.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::kernel::machines::OperationOutcome;
use crate::kernel::operation::{DistributedOperation, GlobalSession, LocalOperationId};

struct Pending {
    replicated: Sender<()>,
    result: Sender<OperationOutcome>,
}

/// Client-side handle for one tracked operation.
pub struct Progress {
    replicated: Receiver<()>,
    result: Receiver<OperationOutcome>,
}

impl Progress {
    /// Wait until the operation has been read from the committed log.
    pub fn await_replication(&self, timeout: Duration) -> bool {
        self.replicated.recv_timeout(timeout).is_ok()
    }

    /// Wait for the dispatch outcome.
    ///
    /// `None` on timeout, or if tracking was aborted.
    pub fn await_result(&self, timeout: Duration) -> Option<OperationOutcome> {
        self.result.recv_timeout(timeout).ok()
    }
}

pub struct ProgressTracker {
    session: GlobalSession,
    pending: Mutex<HashMap<LocalOperationId, Pending>>,
}

impl ProgressTracker {
    pub fn new(session: GlobalSession) -> Self {
        ProgressTracker {
            session,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Begin tracking `operation`.
    pub fn start(&self, operation: &DistributedOperation) -> Progress {
        let (replicated_tx, replicated_rx) = bounded(1);
        let (result_tx, result_rx) = bounded(1);
        self.pending.lock().insert(
            operation.operation_id,
            Pending {
                replicated: replicated_tx,
                result: result_tx,
            },
        );
        Progress {
            replicated: replicated_rx,
            result: result_rx,
        }
    }

    pub fn track_replication(&self, operation: &DistributedOperation) {
        if operation.global_session != self.session {
            return;
        }
        if let Some(pending) = self.pending.lock().get(&operation.operation_id) {
            let _ = pending.replicated.try_send(());
        }
    }

    pub fn track_result(&self, operation: &DistributedOperation, outcome: OperationOutcome) {
        if operation.global_session != self.session {
            return;
        }
        if let Some(pending) = self.pending.lock().remove(&operation.operation_id) {
            let _ = pending.result.try_send(outcome);
        }
    }

    /// Stop tracking; a waiter sees `None`.
    pub fn abort(&self, operation: &DistributedOperation) {
        self.pending.lock().remove(&operation.operation_id);
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::operation::{DummyRequest, MemberId, OperationContent};
    use uuid::Uuid;

    fn operation(session: GlobalSession, seq: u64) -> DistributedOperation {
        DistributedOperation::new(
            session,
            LocalOperationId::new(0, seq),
            OperationContent::Dummy(DummyRequest { payload: vec![] }),
        )
    }

    #[test]
    fn test_replication_then_result() {
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
        let tracker = ProgressTracker::new(session);
        let op = operation(session, 0);

        let progress = tracker.start(&op);
        tracker.track_replication(&op);
        assert!(progress.await_replication(Duration::from_millis(10)));

        tracker.track_result(&op, OperationOutcome::Done);
        assert_eq!(
            progress.await_result(Duration::from_millis(10)),
            Some(OperationOutcome::Done)
        );
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_foreign_session_ignored() {
        let owner = MemberId::random();
        let local = GlobalSession::new(Uuid::new_v4(), owner);
        let foreign = GlobalSession::new(Uuid::new_v4(), owner);
        let tracker = ProgressTracker::new(local);

        let progress = tracker.start(&operation(local, 0));
        tracker.track_result(&operation(foreign, 0), OperationOutcome::Done);

        assert!(progress.await_result(Duration::from_millis(10)).is_none());
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn test_abort_releases_waiter() {
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
        let tracker = ProgressTracker::new(session);
        let op = operation(session, 3);

        let progress = tracker.start(&op);
        tracker.abort(&op);
        assert!(progress.await_result(Duration::from_millis(10)).is_none());
        assert_eq!(tracker.in_flight(), 0);
    }
}
