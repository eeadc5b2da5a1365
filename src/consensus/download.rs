//! Snapshot download service.
//!
//! Runs at most one download job at a time. A job pauses the applier,
//! fetches a snapshot (retrying with backoff), installs it, and resumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::ApplierConfig;
use crate::kernel::applier::ApplierError;
use crate::kernel::coordinator::{CoordinatorError, SnapshotCoordinator};
use crate::kernel::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// One fetch attempt failed.
    #[error("Snapshot fetch failed: {0}")]
    Fetch(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    GaveUp { attempts: u32, last: String },

    #[error("Download service stopped")]
    Stopped,

    #[error("Install failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Applier(#[from] ApplierError),

    #[error("Download job thread lost")]
    WorkerLost,
}

/// Fetches a snapshot from some other member of the cluster.
pub trait SnapshotDownloader: Send + Sync {
    fn download(&self) -> Result<Snapshot, DownloadError>;
}

/// A scheduled job; `wait` blocks until it finished.
pub struct DownloadJob {
    handle: JoinHandle<Result<(), DownloadError>>,
}

impl DownloadJob {
    pub fn wait(self) -> Result<(), DownloadError> {
        self.handle.join().map_err(|_| DownloadError::WorkerLost)?
    }
}

pub struct SnapshotDownloadService {
    downloader: Arc<dyn SnapshotDownloader>,
    coordinator: Arc<SnapshotCoordinator>,
    config: ApplierConfig,
    active: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl SnapshotDownloadService {
    pub fn new(
        downloader: Arc<dyn SnapshotDownloader>,
        coordinator: Arc<SnapshotCoordinator>,
        config: ApplierConfig,
    ) -> Self {
        SnapshotDownloadService {
            downloader,
            coordinator,
            config,
            active: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a download job unless one is already running (or stopped).
    pub fn schedule_download(&self) -> Option<DownloadJob> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let job = Job {
            downloader: self.downloader.clone(),
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
            stopped: self.stopped.clone(),
        };
        let active = self.active.clone();
        let spawned = thread::Builder::new()
            .name("snapshot-download".to_string())
            .spawn(move || {
                let result = job.run();
                active.store(false, Ordering::Release);
                result
            });

        match spawned {
            Ok(handle) => Some(DownloadJob { handle }),
            Err(e) => {
                error!(error = %e, "Failed to spawn snapshot download job");
                self.active.store(false, Ordering::Release);
                None
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Refuse new jobs; a running job stops before its next attempt.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

struct Job {
    downloader: Arc<dyn SnapshotDownloader>,
    coordinator: Arc<SnapshotCoordinator>,
    config: ApplierConfig,
    stopped: Arc<AtomicBool>,
}

impl Job {
    fn run(&self) -> Result<(), DownloadError> {
        let applier = self.coordinator.applier();
        applier.pause("snapshot download")?;
        let result = self.fetch_and_install();
        let resumed = applier.resume("snapshot download");
        result?;
        resumed?;
        Ok(())
    }

    fn fetch_and_install(&self) -> Result<(), DownloadError> {
        let mut failures = 0u32;
        let snapshot = loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(DownloadError::Stopped);
            }
            match self.downloader.download() {
                Ok(snapshot) => break snapshot,
                Err(e) => {
                    failures += 1;
                    let max = self.config.download_max_attempts;
                    if max > 0 && failures >= max {
                        return Err(DownloadError::GaveUp {
                            attempts: failures,
                            last: e.to_string(),
                        });
                    }
                    let backoff = self.config.download_backoff(failures - 1);
                    warn!(
                        attempt = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Snapshot download failed, retrying"
                    );
                    thread::sleep(backoff);
                }
            }
        };

        info!(
            prev_index = snapshot.prev_index,
            attempts = failures + 1,
            "Downloaded snapshot"
        );
        self.coordinator.install_snapshot(&snapshot)?;
        Ok(())
    }
}
