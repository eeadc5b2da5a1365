use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use replicated_apply::engine::{
    ConsecutiveInFlightCache, FileStateStorage, InFlightCache, InMemoryLog, ReplicatedContent,
};
use replicated_apply::kernel::machines::{DummyState, DummyStateMachine, TokenRegistry, TokenStateMachine};
use replicated_apply::kernel::operation::{DummyRequest, TokenRequest, TokenType};
use replicated_apply::kernel::{
    Applier, DatabaseHealth, DistributedOperation, FlushedIndex, GlobalSession, LocalOperationId,
    MemberId, OperationContent, ProgressTracker, SessionTracker, SessionTrackerState,
    StateMachineHub,
};
use replicated_apply::{ApplierConfig, StateStorage};
use uuid::Uuid;

const STATE_DIR: &str = "/tmp/replicated_apply_demo";
const TOTAL_ENTRIES: u64 = 200;
const COMMIT_STEP: i64 = 10;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "clean" => {
                let _ = fs::remove_dir_all(STATE_DIR);
                println!("Cleaned state directory.");
                return;
            }
            "apply" => {
                run_apply_phase();
                return;
            }
            "recover" => {
                run_recovery_phase();
                return;
            }
            "test" => {
                run_crash_test();
                return;
            }
            _ => {
                print_usage();
                return;
            }
        }
    }

    run_crash_test();
}

fn print_usage() {
    eprintln!("Usage: replicated-apply [command]");
    eprintln!("Commands:");
    eprintln!("  clean   - Remove persisted state");
    eprintln!("  apply   - Apply committed entries (may crash randomly)");
    eprintln!("  recover - Recover, apply everything and verify state");
    eprintln!("  test    - Full crash test cycle");
    eprintln!("  (none)  - Same as 'test'");
}

fn fatal(message: &str) -> ! {
    eprintln!("FATAL: {}", message);
    process::exit(1);
}

/// The committed log, identical in every process.
///
/// Every 10th entry is a leader barrier and every 7th a client retry of
/// the previous operation. Returns the log and the number of distinct
/// dummy operations in it.
fn build_log(cache: &dyn InFlightCache) -> (InMemoryLog, u64) {
    let session = GlobalSession::new(
        Uuid::from_u128(0x5e55_1011),
        MemberId(Uuid::from_u128(0x0000_0001)),
    );
    let log = InMemoryLog::new();
    let mut next_sequence = 0u64;
    let mut previous: Option<DistributedOperation> = None;
    let mut dummies = 0u64;

    for i in 0..TOTAL_ENTRIES {
        let content = if i % 10 == 9 {
            ReplicatedContent::NewLeaderBarrier
        } else if i % 7 == 6 && previous.is_some() {
            match previous.clone() {
                Some(op) => ReplicatedContent::Operation(op),
                None => ReplicatedContent::NewLeaderBarrier,
            }
        } else {
            let content = if next_sequence % 3 == 0 {
                OperationContent::TokenAllocation(TokenRequest {
                    token_type: TokenType::Label,
                    name: format!("Label{}", next_sequence % 12),
                })
            } else {
                dummies += 1;
                OperationContent::Dummy(DummyRequest {
                    payload: next_sequence.to_le_bytes().to_vec(),
                })
            };
            let op = DistributedOperation::new(session, LocalOperationId::new(0, next_sequence), content);
            next_sequence += 1;
            previous = Some(op.clone());
            ReplicatedContent::Operation(op)
        };
        cache.put(log.append(1, content));
    }

    (log, dummies)
}

struct Node {
    applier: Applier,
    expected_dummies: u64,
}

fn open_node(dir: &Path) -> Node {
    let config = ApplierConfig {
        max_batch_size: 8,
        flush_every: 16,
        ..ApplierConfig::default()
    };
    if let Err(e) = config.validate() {
        fatal(&format!("Invalid config: {}", e));
    }

    let cache = Arc::new(ConsecutiveInFlightCache::new(config.in_flight_cache_max_entries));
    let (log, expected_dummies) = build_log(cache.as_ref());

    let sessions: FileStateStorage<SessionTrackerState> = FileStateStorage::new(dir.join("sessions.bin"));
    let dummy: FileStateStorage<DummyState> = FileStateStorage::new(dir.join("dummy.bin"));
    let tokens: FileStateStorage<TokenRegistry> = FileStateStorage::new(dir.join("tokens.bin"));
    let hub = StateMachineHub::new(SessionTracker::new(Box::new(sessions)))
        .with(Box::new(DummyStateMachine::new(Box::new(dummy))))
        .with(Box::new(TokenStateMachine::new(Box::new(tokens))));

    let local = GlobalSession::new(Uuid::new_v4(), MemberId::random());
    let applier = Applier::new(
        Arc::new(log),
        cache,
        hub,
        Arc::new(ProgressTracker::new(local)),
        Box::new(FileStateStorage::<FlushedIndex>::new(dir.join("flushed.bin"))),
        Arc::new(DatabaseHealth::new()),
        &config,
    );

    Node {
        applier,
        expected_dummies,
    }
}

fn wait_applied(applier: &Applier, index: i64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while applier.last_applied() < index {
        if applier.is_panicked() {
            fatal("Applier panicked");
        }
        if Instant::now() > deadline {
            fatal(&format!("Timed out waiting for index {}", index));
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Get a deterministic "random" crash point based on the process id.
fn get_crash_point() -> Option<i64> {
    let pid = process::id() as u64;
    let hash = pid.wrapping_mul(2654435761) % TOTAL_ENTRIES;

    // Crash roughly 60% of the time.
    if hash < TOTAL_ENTRIES * 3 / 5 {
        Some(hash as i64)
    } else {
        None
    }
}

/// Apply in commit steps, possibly crashing without a final flush.
fn run_apply_phase() {
    let dir = Path::new(STATE_DIR);
    if let Err(e) = fs::create_dir_all(dir) {
        fatal(&format!("Failed to create {}: {}", STATE_DIR, e));
    }

    let node = open_node(dir);
    if let Err(e) = node.applier.start() {
        fatal(&format!("Failed to start applier: {}", e));
    }
    println!(
        "Starting apply phase: last_flushed={}, last_applied={}",
        node.applier.last_flushed(),
        node.applier.last_applied()
    );

    let crash_at = get_crash_point();
    let last = TOTAL_ENTRIES as i64 - 1;
    let mut committed = node.applier.last_applied();

    while committed < last {
        committed = (committed + COMMIT_STEP).min(last);
        node.applier.notify_committed(committed);

        if matches!(crash_at, Some(point) if committed >= point) {
            println!("SIMULATING CRASH after commit {} (apply thread still running)", committed);
            process::exit(0);
        }
        wait_applied(&node.applier, committed);
    }

    if let Err(e) = node.applier.stop() {
        fatal(&format!("Shutdown flush failed: {}", e));
    }
    println!("Apply phase complete. last_flushed={}", node.applier.last_flushed());
}

/// Recover, apply the whole log, and check nothing was applied twice.
fn run_recovery_phase() {
    let dir = Path::new(STATE_DIR);
    if let Err(e) = fs::create_dir_all(dir) {
        fatal(&format!("Failed to create {}: {}", STATE_DIR, e));
    }

    let node = open_node(dir);
    if let Err(e) = node.applier.start() {
        fatal(&format!("Recovery failed: {}", e));
    }
    println!("Recovered at last_applied={}", node.applier.last_applied());

    let last = TOTAL_ENTRIES as i64 - 1;
    node.applier.notify_committed(last);
    wait_applied(&node.applier, last);
    if let Err(e) = node.applier.stop() {
        fatal(&format!("Shutdown flush failed: {}", e));
    }

    let dummy: DummyState = match FileStateStorage::new(dir.join("dummy.bin")).initial_state() {
        Ok(state) => state,
        Err(e) => fatal(&format!("Failed to read dummy state: {}", e)),
    };
    let tokens: TokenRegistry = match FileStateStorage::new(dir.join("tokens.bin")).initial_state() {
        Ok(state) => state,
        Err(e) => fatal(&format!("Failed to read token state: {}", e)),
    };

    println!("Last flushed index: {}", node.applier.last_flushed());
    println!("Dummy operations applied: {} (expected {})", dummy.count, node.expected_dummies);
    println!("Label tokens: {:?}", tokens.id_of(TokenType::Label, "Label0"));

    if dummy.count != node.expected_dummies {
        eprintln!("MISMATCH: operations lost or applied twice");
        process::exit(1);
    }
    println!("Recovery: CONSISTENT");
}

fn print_round_state(dir: &Path) {
    match FileStateStorage::<FlushedIndex>::new(dir.join("flushed.bin")).initial_state() {
        Ok(FlushedIndex(index)) => println!("  Flushed watermark on disk: {}", index),
        Err(e) => fatal(&format!("Corrupt flush watermark: {}", e)),
    }
}

/// Run a full crash test cycle.
fn run_crash_test() {
    println!("=== Replicated Apply Crash Test ===\n");

    let dir = Path::new(STATE_DIR);

    println!("Phase 1: Cleaning previous state...");
    let _ = fs::remove_dir_all(dir);

    println!("\nPhase 2: Applying with crashes...");
    for round in 0..5 {
        println!("\n--- Round {} ---", round + 1);

        let status = run_subprocess("apply");
        if !status.success() {
            fatal("Apply subprocess failed with non-zero exit");
        }
        print_round_state(dir);
    }

    println!("\nPhase 3: Final recovery...");
    let status = run_subprocess("recover");
    if !status.success() {
        fatal("Recovery subprocess reported inconsistent state");
    }

    println!("\n=== Crash Test Complete ===");
    println!("All rounds passed. Every operation applied exactly once.");
}

fn run_subprocess(command: &str) -> process::ExitStatus {
    let exe = match env::current_exe() {
        Ok(exe) => exe,
        Err(e) => fatal(&format!("Failed to get current executable: {}", e)),
    };
    match process::Command::new(exe).arg(command).status() {
        Ok(status) => status,
        Err(e) => fatal(&format!("Failed to run {} subprocess: {}", command, e)),
    }
}
