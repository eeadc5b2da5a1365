//! Replicated-log applier.
//!
//! # Architecture
//!
//! ```text
//!  consensus ──notify_committed──▶ ApplierShared ◀──await_job── apply thread
//!                                                                  │ owns
//!                                                                  ▼
//!                                  log ──▶ LogEntryReader ──▶ ApplyCore
//!                                  cache ─┘                        │
//!                                                  CommandBatcher ─┴─▶ DispatchStage
//!                                                                        │
//!                                              SessionTracker ◀──────────┤
//!                                              StateMachineHub ◀─────────┘
//! ```
//!
//! # Pausing
//!
//! The applier starts with a pause count of one (released by `start`).
//! Every `pause` must be matched by a `resume`. Only the 0→1 and 1→0
//! transitions touch the thread: pausing cancels it and takes the
//! [`ApplyCore`] back; resuming hands the core to a fresh thread.
//!
//! # Panics
//!
//! Any apply error (including a Rust panic in a state machine) moves the
//! applier to a terminal panicked state and marks the database unhealthy.

mod error;
mod pipeline;
mod state;
mod task;


use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ApplierConfig;
use crate::engine::cache::InFlightCache;
use crate::engine::log::ReplicatedLog;
use crate::engine::storage::StateStorage;
use crate::kernel::health::HealthSignal;
use crate::kernel::hub::StateMachineHub;
use crate::kernel::progress::ProgressTracker;

pub use error::{ApplierError, ApplyError};
pub use pipeline::{ApplyCore, DispatchStage, FlushedIndex};
pub use state::ApplierShared;

use task::ApplyTask;

struct ApplierControl {
    pause_count: i32,
    /// Present whenever no thread is running.
    core: Option<ApplyCore>,
    task: Option<ApplyTask>,
}

pub struct Applier {
    shared: Arc<ApplierShared>,
    control: Mutex<ApplierControl>,
    health: Arc<dyn HealthSignal>,
}

impl Applier {
    pub fn new(
        log: Arc<dyn ReplicatedLog>,
        cache: Arc<dyn InFlightCache>,
        hub: StateMachineHub,
        progress: Arc<ProgressTracker>,
        flushed_storage: Box<dyn StateStorage<FlushedIndex>>,
        health: Arc<dyn HealthSignal>,
        config: &ApplierConfig,
    ) -> Self {
        let shared = Arc::new(ApplierShared::new());
        let core = ApplyCore::new(
            log,
            cache,
            hub,
            progress,
            flushed_storage,
            shared.clone(),
            config,
        );
        Applier {
            shared,
            control: Mutex::new(ApplierControl {
                pause_count: 1,
                core: Some(core),
                task: None,
            }),
            health,
        }
    }

    /// Recover state, replay the log synchronously, then start applying.
    pub fn start(&self) -> Result<(), ApplierError> {
        {
            let mut control = self.control.lock();
            if self.shared.is_panicked() {
                return Err(ApplierError::Panicked {
                    reason: "startup".to_string(),
                });
            }
            let core = control.core.as_mut().ok_or(ApplierError::WorkerLost)?;

            core.restore()?;
            let target = core
                .hub()
                .last_applied_index()
                .max(self.shared.last_seen_commit_index());
            info!(
                last_flushed = core.last_flushed(),
                replay_to = target,
                "Starting applier"
            );

            self.shared.set_keep_running(true);
            if let Err(e) = task::guarded_apply(core, target, &self.shared) {
                task::fail(&self.shared, self.health.as_ref(), &e);
                return Err(e.into());
            }
            self.shared.set_keep_running(false);
            self.shared.notify_committed(core.last_applied());
            info!(last_applied = core.last_applied(), "Recovery replay complete");
        }
        self.resume("startup")
    }

    /// Pause, then flush unconditionally.
    pub fn stop(&self) -> Result<(), ApplierError> {
        self.pause("shutdown")?;
        let mut control = self.control.lock();
        let core = control.core.as_mut().ok_or(ApplierError::WorkerLost)?;
        core.flush()?;
        info!(last_flushed = core.last_flushed(), "Applier stopped");
        Ok(())
    }

    /// Stop applying until a matching `resume`.
    ///
    /// Returns once the apply thread has finished the entry it was on.
    pub fn pause(&self, reason: &str) -> Result<(), ApplierError> {
        let mut control = self.control.lock();
        if self.shared.is_panicked() {
            reap(&mut control);
            return Err(ApplierError::Panicked {
                reason: reason.to_string(),
            });
        }

        control.pause_count += 1;
        info!(reason, pause_count = control.pause_count, "Pausing applier");

        if control.pause_count == 1 {
            reap(&mut control);
            if control.core.is_none() {
                return Err(ApplierError::WorkerLost);
            }
            if self.shared.is_panicked() {
                return Err(ApplierError::Panicked {
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Release one pause; applying restarts when the count reaches zero.
    pub fn resume(&self, reason: &str) -> Result<(), ApplierError> {
        let mut control = self.control.lock();
        if self.shared.is_panicked() {
            return Err(ApplierError::Panicked {
                reason: reason.to_string(),
            });
        }
        if control.pause_count <= 0 {
            warn!(reason, "Resume without matching pause");
            return Err(ApplierError::UnmatchedResume {
                reason: reason.to_string(),
            });
        }

        control.pause_count -= 1;
        info!(reason, pause_count = control.pause_count, "Resuming applier");

        if control.pause_count == 0 {
            let core = control.core.take().ok_or(ApplierError::WorkerLost)?;
            self.shared.set_keep_running(true);
            let task = ApplyTask::spawn(core, self.shared.clone(), self.health.clone())
                .map_err(ApplierError::Spawn)?;
            control.task = Some(task);
        }
        Ok(())
    }

    /// Run `f` against the apply core with the applier paused.
    ///
    /// The resume happens even when `f` fails.
    pub fn with_paused<R>(
        &self,
        reason: &str,
        f: impl FnOnce(&mut ApplyCore) -> R,
    ) -> Result<R, ApplierError> {
        self.pause(reason)?;
        let result = {
            let mut control = self.control.lock();
            match control.core.as_mut() {
                Some(core) => Ok(f(core)),
                None => Err(ApplierError::WorkerLost),
            }
        };
        let resumed = self.resume(reason);
        let value = result?;
        resumed?;
        Ok(value)
    }

    /// Record that consensus has committed up to `index`.
    pub fn notify_committed(&self, index: i64) {
        self.shared.notify_committed(index);
    }

    pub fn pause_count(&self) -> i32 {
        self.control.lock().pause_count
    }

    pub fn last_applied(&self) -> i64 {
        self.shared.last_applied()
    }

    pub fn last_flushed(&self) -> i64 {
        self.shared.last_flushed()
    }

    pub fn last_seen_commit_index(&self) -> i64 {
        self.shared.last_seen_commit_index()
    }

    pub fn is_panicked(&self) -> bool {
        self.shared.is_panicked()
    }
}

/// Stop the running thread, if any, and take the core back.
fn reap(control: &mut ApplierControl) {
    if let Some(task) = control.task.take() {
        task.cancel();
        match task.join() {
            Ok(core) => control.core = Some(core),
            Err(e) => warn!(error = %e, "Apply worker did not return its state"),
        }
    }
}

impl Drop for Applier {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if control.task.is_some() {
            debug!("Dropping running applier");
            reap(control);
        }
    }
}
