//! Snapshot coordination.
//!
//! Snapshots are taken and installed with the applier paused, so every state
//! machine reflects exactly the same log index.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::{ConsensusCoreState, ConsensusError};
use crate::engine::errors::{LogError, StorageError};
use crate::engine::log::ReplicatedLog;
use crate::kernel::applier::{Applier, ApplierError};
use crate::kernel::machines::StateMachineError;
use crate::kernel::snapshot::{Snapshot, StateKind};

/// Granularity of the first-state wait.
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Applier(#[from] ApplierError),

    #[error("Log: {0}")]
    Log(#[from] LogError),

    #[error("State machine: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Flush watermark: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// The snapshot is behind what this replica already applied.
    #[error("Snapshot at {prev_index} is behind last applied index {last_applied}")]
    StaleSnapshot { prev_index: i64, last_applied: i64 },
}

pub struct SnapshotCoordinator {
    applier: Arc<Applier>,
    log: Arc<dyn ReplicatedLog>,
    consensus: Arc<dyn ConsensusCoreState>,
    installed: Mutex<bool>,
    state_available: Condvar,
}

impl SnapshotCoordinator {
    pub fn new(
        applier: Arc<Applier>,
        log: Arc<dyn ReplicatedLog>,
        consensus: Arc<dyn ConsensusCoreState>,
    ) -> Self {
        SnapshotCoordinator {
            applier,
            log,
            consensus,
            installed: Mutex::new(false),
            state_available: Condvar::new(),
        }
    }

    pub fn applier(&self) -> &Arc<Applier> {
        &self.applier
    }

    /// Capture every state machine at the applier's current index.
    pub fn snapshot(&self) -> Result<Snapshot, CoordinatorError> {
        let snapshot = self.applier.with_paused("snapshot", |core| {
            let prev_index = core.last_applied();
            let prev_term = self.log.read_entry_term(prev_index)?;
            let mut snapshot = Snapshot::new(prev_index, prev_term);
            core.hub().augment_snapshot(&mut snapshot)?;
            snapshot.add(StateKind::ConsensusCore, self.consensus.core_state()?);
            Ok::<_, CoordinatorError>(snapshot)
        })??;

        info!(
            prev_index = snapshot.prev_index,
            prev_term = snapshot.prev_term,
            "Captured snapshot"
        );
        Ok(snapshot)
    }

    /// Replace local state with `snapshot` and continue after its index.
    pub fn install_snapshot(&self, snapshot: &Snapshot) -> Result<(), CoordinatorError> {
        let prev_index = snapshot.prev_index;
        self.applier.with_paused("snapshot install", |core| {
            if prev_index < core.last_applied() {
                return Err(CoordinatorError::StaleSnapshot {
                    prev_index,
                    last_applied: core.last_applied(),
                });
            }

            if self.log.skip(prev_index, snapshot.prev_term)? {
                debug!(prev_index, "Log reset to snapshot prefix");
                core.cache().truncate(0);
            }
            core.hub_mut().install_snapshot(snapshot)?;
            if let Some(bytes) = snapshot.get(StateKind::ConsensusCore) {
                self.consensus.install_core_state(bytes)?;
            }
            core.hub_mut().flush()?;
            core.fast_forward(prev_index)?;
            self.applier.notify_committed(prev_index);
            Ok(())
        })??;

        *self.installed.lock() = true;
        self.state_available.notify_all();
        info!(prev_index, prev_term = snapshot.prev_term, "Installed snapshot");
        Ok(())
    }

    /// Prune the log up to the durably flushed index. Returns the new
    /// prev index.
    pub fn prune_log(&self) -> Result<i64, CoordinatorError> {
        let safe_index = self.applier.last_flushed();
        let prev_index = self.log.prune(safe_index)?;
        debug!(safe_index, prev_index, "Pruned log");
        Ok(prev_index)
    }

    /// Block until there is local state to serve from.
    pub fn await_state(&self) {
        while !self.await_state_timeout(STATE_POLL_INTERVAL) {}
    }

    /// Wait until the log has an entry or a snapshot has been installed.
    pub fn await_state_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut installed = self.installed.lock();
        loop {
            if *installed || self.log.append_index() >= 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // The log has no hook of its own, so appends are polled.
            let wait = (deadline - now).min(STATE_POLL_INTERVAL);
            self.state_available.wait_for(&mut installed, wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApplierConfig;
    use crate::engine::cache::ConsecutiveInFlightCache;
    use crate::engine::log::{InMemoryLog, ReplicatedContent, NOTHING};
    use crate::engine::storage::InMemoryStateStorage;
    use crate::kernel::applier::FlushedIndex;
    use crate::kernel::health::DatabaseHealth;
    use crate::kernel::hub::StateMachineHub;
    use crate::kernel::machines::{DummyState, DummyStateMachine};
    use crate::kernel::operation::{
        DistributedOperation, DummyRequest, GlobalSession, LocalOperationId, MemberId,
        OperationContent,
    };
    use crate::kernel::progress::ProgressTracker;
    use crate::kernel::session::{SessionTracker, SessionTrackerState};
    use std::thread;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeCore(Mutex<Vec<u8>>);

    impl ConsensusCoreState for FakeCore {
        fn core_state(&self) -> Result<Vec<u8>, ConsensusError> {
            Ok(self.0.lock().clone())
        }

        fn install_core_state(&self, bytes: &[u8]) -> Result<(), ConsensusError> {
            *self.0.lock() = bytes.to_vec();
            Ok(())
        }
    }

    struct Replica {
        log: Arc<InMemoryLog>,
        dummy: InMemoryStateStorage<DummyState>,
        sessions: InMemoryStateStorage<SessionTrackerState>,
        flushed: InMemoryStateStorage<FlushedIndex>,
        core: Arc<FakeCore>,
        coordinator: SnapshotCoordinator,
    }

    fn replica() -> Replica {
        let log = Arc::new(InMemoryLog::new());
        let dummy = InMemoryStateStorage::new();
        let sessions = InMemoryStateStorage::new();
        let flushed = InMemoryStateStorage::new();
        let core = Arc::new(FakeCore::default());

        let hub = StateMachineHub::new(SessionTracker::new(Box::new(sessions.clone())))
            .with(Box::new(DummyStateMachine::new(Box::new(dummy.clone()))));
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
        let applier = Arc::new(Applier::new(
            log.clone(),
            Arc::new(ConsecutiveInFlightCache::new(32)),
            hub,
            Arc::new(ProgressTracker::new(session)),
            Box::new(flushed.clone()),
            Arc::new(DatabaseHealth::new()),
            &ApplierConfig {
                max_batch_size: 4,
                flush_every: 8,
                ..ApplierConfig::default()
            },
        ));
        let coordinator = SnapshotCoordinator::new(applier, log.clone(), core.clone());
        Replica {
            log,
            dummy,
            sessions,
            flushed,
            core,
            coordinator,
        }
    }

    fn append(log: &InMemoryLog, session: GlobalSession, sequence: u64) -> i64 {
        let op = DistributedOperation::new(
            session,
            LocalOperationId::new(0, sequence),
            OperationContent::Dummy(DummyRequest { payload: vec![] }),
        );
        log.append(3, ReplicatedContent::Operation(op)).index as i64
    }

    fn wait_applied(applier: &Applier, index: i64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while applier.last_applied() < index && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(applier.last_applied(), index);
    }

    #[test]
    fn test_snapshot_captures_current_index() {
        let r = replica();
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
        *r.core.0.lock() = vec![7, 7];
        r.coordinator.applier().start().unwrap();

        for seq in 0..5 {
            append(&r.log, session, seq);
        }
        r.coordinator.applier().notify_committed(4);
        wait_applied(r.coordinator.applier(), 4);

        let snapshot = r.coordinator.snapshot().unwrap();
        assert_eq!(snapshot.prev_index, 4);
        assert_eq!(snapshot.prev_term, 3);
        assert_eq!(snapshot.get(StateKind::ConsensusCore), Some(&[7u8, 7][..]));
        let dummy: DummyState = snapshot.state(StateKind::Dummy).unwrap();
        assert_eq!(dummy.count, 5);
        assert_eq!(r.coordinator.applier().pause_count(), 0);
    }

    #[test]
    fn test_snapshot_is_consistent_under_concurrent_commits() {
        let r = Arc::new(replica());
        r.coordinator.applier().start().unwrap();
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());

        let writer = {
            let r = r.clone();
            thread::spawn(move || {
                for seq in 0..300 {
                    let index = append(&r.log, session, seq);
                    r.coordinator.applier().notify_committed(index);
                }
            })
        };

        for _ in 0..30 {
            let snapshot = r.coordinator.snapshot().unwrap();
            let sessions: SessionTrackerState = snapshot.state(StateKind::SessionTracker).unwrap();
            let dummy: DummyState = snapshot.state(StateKind::Dummy).unwrap();
            assert_eq!(sessions.log_index(), snapshot.prev_index);
            assert_eq!(dummy.last_applied_index, snapshot.prev_index);
            assert_eq!(dummy.count as i64, snapshot.prev_index + 1);
        }

        writer.join().unwrap();
        wait_applied(r.coordinator.applier(), 299);
        r.coordinator.applier().stop().unwrap();
    }

    #[test]
    fn test_install_snapshot_fast_forwards_follower() {
        let leader = replica();
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
        *leader.core.0.lock() = vec![1, 2, 3];
        leader.coordinator.applier().start().unwrap();
        for seq in 0..10 {
            append(&leader.log, session, seq);
        }
        leader.coordinator.applier().notify_committed(9);
        wait_applied(leader.coordinator.applier(), 9);
        let snapshot = leader.coordinator.snapshot().unwrap();

        let follower = replica();
        assert!(!follower.coordinator.await_state_timeout(Duration::from_millis(10)));

        follower.coordinator.install_snapshot(&snapshot).unwrap();
        assert!(follower.coordinator.await_state_timeout(Duration::from_millis(10)));
        assert_eq!(follower.log.prev_index(), 9);
        assert_eq!(follower.log.append_index(), 9);
        assert_eq!(*follower.core.0.lock(), vec![1, 2, 3]);
        assert_eq!(follower.flushed.stored(), Some(FlushedIndex(9)));
        assert_eq!(follower.dummy.stored().unwrap().count, 10);
        assert_eq!(follower.sessions.stored().unwrap().log_index(), 9);

        // Applying continues after the snapshot; replays of old operations
        // are still rejected by the installed session table.
        let applier = follower.coordinator.applier();
        applier.start().unwrap();
        assert_eq!(applier.last_applied(), 9);
        append(&follower.log, session, 5);
        append(&follower.log, session, 10);
        applier.notify_committed(11);
        wait_applied(applier, 11);
        applier.stop().unwrap();
        assert_eq!(follower.dummy.stored().unwrap().count, 11);
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let r = replica();
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
        r.coordinator.applier().start().unwrap();
        for seq in 0..3 {
            append(&r.log, session, seq);
        }
        r.coordinator.applier().notify_committed(2);
        wait_applied(r.coordinator.applier(), 2);

        let stale = Snapshot::new(NOTHING, NOTHING);
        assert!(matches!(
            r.coordinator.install_snapshot(&stale),
            Err(CoordinatorError::StaleSnapshot { .. })
        ));
        assert_eq!(r.coordinator.applier().pause_count(), 0);
    }

    #[test]
    fn test_prune_log_stops_at_flushed_index() {
        let r = replica();
        let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
        r.coordinator.applier().start().unwrap();
        for seq in 0..12 {
            append(&r.log, session, seq);
        }
        r.coordinator.applier().notify_committed(11);
        wait_applied(r.coordinator.applier(), 11);

        // flush_every = 8: flushed through index 7.
        assert_eq!(r.coordinator.applier().last_flushed(), 7);
        assert_eq!(r.coordinator.prune_log().unwrap(), 7);
        assert_eq!(r.log.prev_index(), 7);
        assert!(r.coordinator.await_state_timeout(Duration::from_millis(1)));
    }
}
