//! End-to-end tests: consensus messages driving two replicas.

use super::*;
use crate::config::ApplierConfig;
use crate::engine::cache::ConsecutiveInFlightCache;
use crate::engine::log::{InMemoryLog, ReplicatedContent};
use crate::engine::storage::InMemoryStateStorage;
use crate::kernel::applier::{Applier, FlushedIndex};
use crate::kernel::coordinator::SnapshotCoordinator;
use crate::kernel::health::{DatabaseHealth, HealthSignal};
use crate::kernel::hub::StateMachineHub;
use crate::kernel::machines::{LockTokenState, LockTokenStateMachine};
use crate::kernel::operation::{
    DistributedOperation, GlobalSession, LocalOperationId, LockTokenRequest, MemberId,
    OperationContent,
};
use crate::kernel::progress::ProgressTracker;
use crate::kernel::session::{SessionTracker, SessionTrackerState};
use crate::kernel::snapshot::Snapshot;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

enum Message {
    Commit(i64),
    Behind,
    Corrupt,
}

#[derive(Default)]
struct FakeEngine {
    panicked: AtomicBool,
    core: Mutex<Vec<u8>>,
}

impl ConsensusEngine for FakeEngine {
    type Message = Message;

    fn handle(&self, message: Message) -> Result<ConsensusOutcome, ConsensusError> {
        match message {
            Message::Commit(index) => Ok(ConsensusOutcome::committed(index)),
            Message::Behind => Ok(ConsensusOutcome::needs_snapshot(-1)),
            Message::Corrupt => Err(ConsensusError::Engine("corrupt term".to_string())),
        }
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }
}

impl ConsensusCoreState for FakeEngine {
    fn core_state(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(self.core.lock().clone())
    }

    fn install_core_state(&self, bytes: &[u8]) -> Result<(), ConsensusError> {
        *self.core.lock() = bytes.to_vec();
        Ok(())
    }
}

/// Serves a fixed snapshot after failing a number of times.
struct FlakyDownloader {
    snapshot: Snapshot,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl SnapshotDownloader for FlakyDownloader {
    fn download(&self) -> Result<Snapshot, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(DownloadError::Fetch("connection refused".to_string()));
        }
        Ok(self.snapshot.clone())
    }
}

struct Node {
    log: Arc<InMemoryLog>,
    locks: InMemoryStateStorage<LockTokenState>,
    flushed: InMemoryStateStorage<FlushedIndex>,
    engine: Arc<FakeEngine>,
    health: Arc<DatabaseHealth>,
    applier: Arc<Applier>,
    coordinator: Arc<SnapshotCoordinator>,
}

fn config() -> ApplierConfig {
    ApplierConfig {
        max_batch_size: 2,
        flush_every: 3,
        download_retry_base_ms: 1,
        download_retry_max_ms: 4,
        ..ApplierConfig::default()
    }
}

fn node() -> Node {
    let log = Arc::new(InMemoryLog::new());
    let locks = InMemoryStateStorage::new();
    let flushed = InMemoryStateStorage::new();
    let engine = Arc::new(FakeEngine::default());
    let health = Arc::new(DatabaseHealth::new());

    let sessions: InMemoryStateStorage<SessionTrackerState> = InMemoryStateStorage::new();
    let hub = StateMachineHub::new(SessionTracker::new(Box::new(sessions)))
        .with(Box::new(LockTokenStateMachine::new(Box::new(locks.clone()))));
    let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
    let applier = Arc::new(Applier::new(
        log.clone(),
        Arc::new(ConsecutiveInFlightCache::new(16)),
        hub,
        Arc::new(ProgressTracker::new(session)),
        Box::new(flushed.clone()),
        health.clone(),
        &config(),
    ));
    let coordinator = Arc::new(SnapshotCoordinator::new(
        applier.clone(),
        log.clone(),
        engine.clone(),
    ));
    Node {
        log,
        locks,
        flushed,
        engine,
        health,
        applier,
        coordinator,
    }
}

fn notifier(node: &Node, downloader: Arc<dyn SnapshotDownloader>) -> CommitNotifier<FakeEngine> {
    let downloads = Arc::new(SnapshotDownloadService::new(
        downloader,
        node.coordinator.clone(),
        config(),
    ));
    CommitNotifier::new(
        node.engine.clone(),
        node.applier.clone(),
        downloads,
        node.health.clone(),
    )
}

fn lock_request(session: GlobalSession, sequence: u64, candidate_id: u64) -> ReplicatedContent {
    ReplicatedContent::Operation(DistributedOperation::new(
        session,
        LocalOperationId::new(0, sequence),
        OperationContent::LockToken(LockTokenRequest {
            owner: session.owner,
            candidate_id,
        }),
    ))
}

fn wait_applied(applier: &Applier, index: i64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while applier.last_applied() < index && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(applier.last_applied(), index);
}

struct NoDownloads;

impl SnapshotDownloader for NoDownloads {
    fn download(&self) -> Result<Snapshot, DownloadError> {
        Err(DownloadError::Fetch("no peers".to_string()))
    }
}

#[test]
fn test_commit_messages_drive_the_applier() {
    let n = node();
    n.applier.start().unwrap();
    let notifier = notifier(&n, Arc::new(NoDownloads));
    let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());

    for (seq, candidate) in [0u64, 1, 2].into_iter().enumerate() {
        n.log.append(1, lock_request(session, seq as u64, candidate));
    }
    notifier.handle(Message::Commit(1)).unwrap();
    wait_applied(&n.applier, 1);
    notifier.handle(Message::Commit(2)).unwrap();
    wait_applied(&n.applier, 2);

    n.applier.stop().unwrap();
    assert_eq!(n.locks.stored().unwrap().token_id, 2);
    assert_eq!(n.flushed.stored(), Some(FlushedIndex(2)));
}

#[test]
fn test_lagging_replica_catches_up_through_snapshot() {
    let leader = node();
    *leader.engine.core.lock() = b"term=4".to_vec();
    leader.applier.start().unwrap();
    let session = GlobalSession::new(Uuid::new_v4(), MemberId::random());
    for seq in 0..6u64 {
        leader.log.append(4, lock_request(session, seq, seq));
    }
    leader.applier.notify_committed(5);
    wait_applied(&leader.applier, 5);
    let snapshot = leader.coordinator.snapshot().unwrap();

    let follower = node();
    follower.applier.start().unwrap();
    let downloader = Arc::new(FlakyDownloader {
        snapshot,
        failures_left: AtomicU32::new(2),
        calls: AtomicU32::new(0),
    });
    let notifier = notifier(&follower, downloader.clone());

    notifier.handle(Message::Behind).unwrap();

    assert_eq!(downloader.calls.load(Ordering::SeqCst), 3);
    assert_eq!(follower.applier.pause_count(), 0);
    assert_eq!(follower.applier.last_applied(), 5);
    assert_eq!(follower.locks.stored().unwrap().token_id, 5);
    assert_eq!(*follower.engine.core.lock(), b"term=4".to_vec());

    // The follower keeps applying what the leader replicates next.
    follower.log.append(4, lock_request(session, 6, 6));
    notifier.handle(Message::Commit(6)).unwrap();
    wait_applied(&follower.applier, 6);
    follower.applier.stop().unwrap();
    assert_eq!(follower.locks.stored().unwrap().token_id, 6);
}

#[test]
fn test_download_gives_up_after_max_attempts() {
    let n = node();
    n.applier.start().unwrap();
    let downloads = SnapshotDownloadService::new(
        Arc::new(NoDownloads),
        n.coordinator.clone(),
        ApplierConfig {
            download_max_attempts: 3,
            ..config()
        },
    );

    let job = downloads.schedule_download().unwrap();
    assert!(matches!(
        job.wait(),
        Err(DownloadError::GaveUp { attempts: 3, .. })
    ));
    assert!(!downloads.is_active());
    assert_eq!(n.applier.pause_count(), 0);
}

/// Blocks each download until released.
struct GatedDownloader {
    release: crossbeam_channel::Receiver<()>,
}

impl SnapshotDownloader for GatedDownloader {
    fn download(&self) -> Result<Snapshot, DownloadError> {
        let _ = self.release.recv();
        Err(DownloadError::Fetch("released".to_string()))
    }
}

#[test]
fn test_one_download_job_at_a_time() {
    let n = node();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let downloads = SnapshotDownloadService::new(
        Arc::new(GatedDownloader { release: release_rx }),
        n.coordinator.clone(),
        config(),
    );

    let job = downloads.schedule_download().unwrap();
    assert!(downloads.is_active());
    assert!(downloads.schedule_download().is_none());

    downloads.stop();
    release_tx.send(()).unwrap();
    assert!(matches!(job.wait(), Err(DownloadError::Stopped)));
    assert!(downloads.schedule_download().is_none());
    // Never started: back at the initial pause.
    assert_eq!(n.applier.pause_count(), 1);
}

#[test]
fn test_engine_failure_takes_replica_offline() {
    let n = node();
    n.applier.start().unwrap();
    let notifier = notifier(&n, Arc::new(NoDownloads));

    let err = notifier.handle(Message::Corrupt).unwrap_err();
    assert!(matches!(err, NotifierError::Consensus(ConsensusError::Engine(_))));
    assert!(n.engine.panicked.load(Ordering::SeqCst));
    assert!(!n.health.is_healthy());
    assert!(n.health.cause().unwrap().contains("corrupt term"));
}
