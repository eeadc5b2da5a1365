use std::io;

use thiserror::Error;

/// Errors raised while reading the replicated log.
#[derive(Debug, Error)]
pub enum LogError {
    /// The index lies before the log's retained prefix (pruned or skipped).
    #[error("Index {index} was compacted away (prev_index: {prev_index})")]
    Compacted { index: i64, prev_index: i64 },

    /// The index is past the log's append index.
    #[error("Index {index} beyond append index {append_index}")]
    BeyondAppendIndex { index: i64, append_index: i64 },

    /// Skip requested to a point behind the current prefix.
    #[error("Cannot skip to index {index}: log already starts after {prev_index}")]
    SkipBehindPrefix { index: i64, prev_index: i64 },

    /// IO error from a durable log implementation.
    #[error("Log IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by durable state storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during read/write.
    #[error("Storage IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic bytes.
    #[error("Invalid state file magic")]
    InvalidMagic,

    /// Unsupported format version.
    #[error("Unsupported state file version: {0}")]
    UnsupportedVersion(u16),

    /// File too small to contain the header.
    #[error("State file too small for header")]
    FileTooSmall,

    /// Header checksum mismatch.
    #[error("Header checksum mismatch: expected {expected}, got {actual}")]
    HeaderChecksumMismatch { expected: u32, actual: u32 },

    /// Body checksum mismatch.
    #[error("Body checksum mismatch: expected {expected}, got {actual}")]
    BodyChecksumMismatch { expected: u32, actual: u32 },

    /// Body size differs from the header.
    #[error("Body size mismatch: expected {expected}, got {actual}")]
    BodySizeMismatch { expected: u64, actual: usize },

    /// Body could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Errors raised by the sequential entry reader.
#[derive(Debug, Error)]
pub enum ReadError {
    /// A committed entry is neither cached nor readable from the log.
    #[error("Committed entry {index} is missing from the log")]
    MissingEntry { index: u64 },

    /// Reads must move strictly forward.
    #[error("Read of index {requested} after {last_read}: reader only moves forward")]
    NotIncreasing { requested: u64, last_read: u64 },

    /// The underlying log failed.
    #[error(transparent)]
    Log(#[from] LogError),
}
