//! Applier configuration (batching, flush cadence, cache bounds, download retry).

use std::time::Duration;

use serde::Deserialize;

/// Default number of operations grouped into one dispatch batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 16;

/// Default number of applied entries between two threshold flushes.
pub const DEFAULT_FLUSH_EVERY: i64 = 4096;

/// Default in-flight cache capacity (entries).
pub const DEFAULT_IN_FLIGHT_CACHE_MAX_ENTRIES: usize = 1024;

/// Default first backoff between snapshot download attempts.
pub const DEFAULT_DOWNLOAD_RETRY_BASE_MS: u64 = 100;

/// Default backoff ceiling between snapshot download attempts.
pub const DEFAULT_DOWNLOAD_RETRY_MAX_MS: u64 = 3200;

/// Applier configuration.
///
/// Deserializable so a host can embed it in its own config file; every
/// missing field falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    /// Maximum number of operations per dispatch batch.
    ///
    /// A full batch is dispatched synchronously on the apply thread, which
    /// keeps the log reader from running ahead of dispatch.
    ///
    /// Default: 16
    pub max_batch_size: usize,

    /// Flush all state machines once `last_applied - last_flushed` reaches
    /// this many entries.
    ///
    /// Skipped (duplicate) operations count toward the window. The check
    /// runs once per dispatched batch and once per non-operation entry, so
    /// with `max_batch_size > 1` a flush can land up to
    /// `max_batch_size - 1` entries past the threshold.
    ///
    /// Default: 4096
    pub flush_every: i64,

    /// Capacity of the in-flight cache, in entries.
    ///
    /// Default: 1024
    pub in_flight_cache_max_entries: usize,

    /// Drop cache entries once the applier has read past them.
    ///
    /// Default: true
    pub prune_cache_after_read: bool,

    /// First backoff between failed snapshot download attempts.
    ///
    /// Default: 100ms
    pub download_retry_base_ms: u64,

    /// Upper bound of the doubling download backoff.
    ///
    /// Default: 3200ms
    pub download_retry_max_ms: u64,

    /// Give up a download job after this many failed attempts (0 = never).
    ///
    /// Default: 0
    pub download_max_attempts: u32,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_every: DEFAULT_FLUSH_EVERY,
            in_flight_cache_max_entries: DEFAULT_IN_FLIGHT_CACHE_MAX_ENTRIES,
            prune_cache_after_read: true,
            download_retry_base_ms: DEFAULT_DOWNLOAD_RETRY_BASE_MS,
            download_retry_max_ms: DEFAULT_DOWNLOAD_RETRY_MAX_MS,
            download_max_attempts: 0,
        }
    }
}

impl ApplierConfig {
    /// Validate configuration (ensure invariants hold).
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be > 0".to_string());
        }

        if self.flush_every <= 0 {
            return Err(format!("flush_every ({}) must be > 0", self.flush_every));
        }

        if self.in_flight_cache_max_entries == 0 {
            return Err("in_flight_cache_max_entries must be > 0".to_string());
        }

        if self.download_retry_base_ms > self.download_retry_max_ms {
            return Err(format!(
                "download_retry_base_ms ({}) must be <= download_retry_max_ms ({})",
                self.download_retry_base_ms, self.download_retry_max_ms
            ));
        }

        Ok(())
    }

    /// Backoff before the given download retry attempt (0-based).
    ///
    /// Doubles from the base delay and saturates at the configured maximum.
    pub fn download_backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.min(16));
        let delay_ms = self
            .download_retry_base_ms
            .saturating_mul(multiplier)
            .min(self.download_retry_max_ms);
        Duration::from_millis(delay_ms)
    }
}
