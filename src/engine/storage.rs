//! Durable single-value state storage.
//!
//! Used for the flush watermark, the session tracker table and every
//! reference state machine. Each value lives in its own file:
//!
//! ```text
//! +-------+---------+----------+----------+-----------+----------+
//! | magic | version | reserved | body_len | body_crc  | hdr_crc  |
//! | 4B    | 2B      | 2B       | 8B       | 4B        | 4B       |
//! +-------+---------+----------+----------+-----------+----------+
//! | bincode body (body_len bytes)                                |
//! +--------------------------------------------------------------+
//! ```
//!
//! Updates use the write-tmp, fsync, rename, fsync-dir pattern, so a crash
//! leaves either the previous or the new value on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::errors::StorageError;

/// State file magic bytes: "RAST".
pub const STATE_MAGIC: [u8; 4] = [0x52, 0x41, 0x53, 0x54];

/// Current state file format version.
pub const STATE_VERSION: u16 = 1;

/// Header size in bytes.
pub const STATE_HEADER_SIZE: usize = 24;

/// Load-or-default plus persist for one value.
pub trait StateStorage<T>: Send + Sync {
    /// The persisted value, or the default if nothing was ever persisted.
    fn initial_state(&self) -> Result<T, StorageError>;

    /// Durably replace the stored value.
    fn persist(&self, state: &T) -> Result<(), StorageError>;
}

// =============================================================================
// FILE STORAGE
// =============================================================================

/// File-backed storage for a serde value.
pub struct FileStateStorage<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FileStateStorage<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStateStorage {
            path: path.into(),
            _marker: PhantomData,
        }
    }
}

fn encode_header(body: &[u8]) -> [u8; STATE_HEADER_SIZE] {
    let mut header = [0u8; STATE_HEADER_SIZE];
    header[0..4].copy_from_slice(&STATE_MAGIC);
    header[4..6].copy_from_slice(&STATE_VERSION.to_le_bytes());
    // reserved (6..8)
    header[8..16].copy_from_slice(&(body.len() as u64).to_le_bytes());
    header[16..20].copy_from_slice(&crc32c::crc32c(body).to_le_bytes());
    let header_crc = crc32c::crc32c(&header[0..20]);
    header[20..24].copy_from_slice(&header_crc.to_le_bytes());
    header
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Validate a full state file image and return its body.
fn decode_body(bytes: &[u8]) -> Result<&[u8], StorageError> {
    if bytes.len() < STATE_HEADER_SIZE {
        return Err(StorageError::FileTooSmall);
    }
    let header = &bytes[..STATE_HEADER_SIZE];

    if header[0..4] != STATE_MAGIC {
        return Err(StorageError::InvalidMagic);
    }

    let expected = read_u32(header, 20);
    let actual = crc32c::crc32c(&header[0..20]);
    if expected != actual {
        return Err(StorageError::HeaderChecksumMismatch { expected, actual });
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != STATE_VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }

    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&header[8..16]);
    let body_len = u64::from_le_bytes(len_buf);
    let body = &bytes[STATE_HEADER_SIZE..];
    if body.len() as u64 != body_len {
        return Err(StorageError::BodySizeMismatch {
            expected: body_len,
            actual: body.len(),
        });
    }

    let expected = read_u32(header, 16);
    let actual = crc32c::crc32c(body);
    if expected != actual {
        return Err(StorageError::BodyChecksumMismatch { expected, actual });
    }

    Ok(body)
}

impl<T> StateStorage<T> for FileStateStorage<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    fn initial_state(&self) -> Result<T, StorageError> {
        if !self.path.exists() {
            return Ok(T::default());
        }

        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;
        let body = decode_body(&bytes)?;
        Ok(bincode::deserialize(body)?)
    }

    fn persist(&self, state: &T) -> Result<(), StorageError> {
        let body = bincode::serialize(state)?;
        let header = encode_header(&body);
        let tmp_path = self.path.with_extension("state.tmp");

        {
            let mut tmp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp_file.write_all(&header)?;
            tmp_file.write_all(&body)?;
            tmp_file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                // Directory fsync is best effort.
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

// =============================================================================
// IN-MEMORY STORAGE
// =============================================================================

/// Storage that keeps the last persisted value in memory.
///
/// Clones share the same slot, so a test can hand one clone to a component
/// and inspect the other.
pub struct InMemoryStateStorage<T> {
    inner: Arc<Mutex<MemorySlot<T>>>,
}

struct MemorySlot<T> {
    value: Option<T>,
    persist_count: u64,
}

impl<T> InMemoryStateStorage<T> {
    pub fn new() -> Self {
        InMemoryStateStorage {
            inner: Arc::new(Mutex::new(MemorySlot {
                value: None,
                persist_count: 0,
            })),
        }
    }

    /// Number of successful `persist` calls.
    pub fn persist_count(&self) -> u64 {
        self.inner.lock().persist_count
    }
}

impl<T: Clone> InMemoryStateStorage<T> {
    /// Start from an already persisted value.
    pub fn with_state(state: T) -> Self {
        let storage = Self::new();
        storage.inner.lock().value = Some(state);
        storage
    }

    /// Last persisted value, if any.
    pub fn stored(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }
}

impl<T> Clone for InMemoryStateStorage<T> {
    fn clone(&self) -> Self {
        InMemoryStateStorage {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for InMemoryStateStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StateStorage<T> for InMemoryStateStorage<T>
where
    T: Clone + Default + Send,
{
    fn initial_state(&self) -> Result<T, StorageError> {
        Ok(self.inner.lock().value.clone().unwrap_or_default())
    }

    fn persist(&self, state: &T) -> Result<(), StorageError> {
        let mut slot = self.inner.lock();
        slot.value = Some(state.clone());
        slot.persist_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_default() {
        let dir = TempDir::new().unwrap();
        let storage: FileStateStorage<i64> = FileStateStorage::new(dir.path().join("absent"));
        assert_eq!(storage.initial_state().unwrap(), 0);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.state");

        let mut table = BTreeMap::new();
        table.insert(7u64, 42i64);
        table.insert(9u64, -1i64);

        FileStateStorage::<BTreeMap<u64, i64>>::new(&path)
            .persist(&table)
            .unwrap();
        let reopened: FileStateStorage<BTreeMap<u64, i64>> = FileStateStorage::new(&path);
        assert_eq!(reopened.initial_state().unwrap(), table);
        assert!(!path.with_extension("state.tmp").exists());
    }

    #[test]
    fn test_corrupted_body_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flushed.state");
        let storage: FileStateStorage<i64> = FileStateStorage::new(&path);
        storage.persist(&1234).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            storage.initial_state(),
            Err(StorageError::BodyChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_header_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flushed.state");
        let storage: FileStateStorage<i64> = FileStateStorage::new(&path);
        storage.persist(&5).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[9] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            storage.initial_state(),
            Err(StorageError::HeaderChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_magic_and_short_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.state");
        let storage: FileStateStorage<i64> = FileStateStorage::new(&path);

        fs::write(&path, [0u8; 4]).unwrap();
        assert!(matches!(storage.initial_state(), Err(StorageError::FileTooSmall)));

        fs::write(&path, [0u8; STATE_HEADER_SIZE + 8]).unwrap();
        assert!(matches!(storage.initial_state(), Err(StorageError::InvalidMagic)));
    }

    #[test]
    fn test_in_memory_counts_persists() {
        let storage = InMemoryStateStorage::<i64>::new();
        let observer = storage.clone();
        assert_eq!(storage.initial_state().unwrap(), 0);

        storage.persist(&3).unwrap();
        storage.persist(&8).unwrap();
        assert_eq!(observer.persist_count(), 2);
        assert_eq!(observer.stored(), Some(8));
        assert_eq!(observer.initial_state().unwrap(), 8);
    }
}
