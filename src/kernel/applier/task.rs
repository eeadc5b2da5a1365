//! The apply thread.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::kernel::health::HealthSignal;

use super::pipeline::ApplyCore;
use super::error::{ApplierError, ApplyError};
use super::state::ApplierShared;

/// Handle to a running apply thread. Joining gives the core back.
pub(super) struct ApplyTask {
    shared: Arc<ApplierShared>,
    handle: JoinHandle<ApplyCore>,
}

impl ApplyTask {
    pub(super) fn spawn(
        core: ApplyCore,
        shared: Arc<ApplierShared>,
        health: Arc<dyn HealthSignal>,
    ) -> io::Result<Self> {
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("apply-worker".to_string())
            .spawn(move || run(core, worker_shared, health))?;
        Ok(ApplyTask { shared, handle })
    }

    /// Ask the thread to stop after the entry it is applying.
    pub(super) fn cancel(&self) {
        self.shared.set_keep_running(false);
    }

    pub(super) fn join(self) -> Result<ApplyCore, ApplierError> {
        self.handle.join().map_err(|_| ApplierError::WorkerLost)
    }
}

fn run(mut core: ApplyCore, shared: Arc<ApplierShared>, health: Arc<dyn HealthSignal>) -> ApplyCore {
    debug!(last_applied = core.last_applied(), "Apply worker started");

    while let Some(target) = shared.await_job(core.last_applied()) {
        if let Err(e) = guarded_apply(&mut core, target, &shared) {
            fail(&shared, health.as_ref(), &e);
            break;
        }
    }

    debug!(last_applied = core.last_applied(), "Apply worker exiting");
    core
}

/// Run one apply pass, turning a Rust panic into `ApplyError::Poisoned`.
pub(super) fn guarded_apply(core: &mut ApplyCore, target: i64, shared: &ApplierShared) -> Result<(), ApplyError> {
    match panic::catch_unwind(AssertUnwindSafe(|| core.apply_up_to(target, shared))) {
        Ok(result) => result,
        Err(payload) => Err(ApplyError::Poisoned {
            last_applied: core.last_applied(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Enter the terminal state: no more applies, database marked unhealthy.
pub(super) fn fail(shared: &ApplierShared, health: &dyn HealthSignal, error: &ApplyError) {
    shared.panic();
    error!(error = %error, last_applied = shared.last_applied(), "Applier panicked");
    health.panic(&format!("Applier panicked: {}", error));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
