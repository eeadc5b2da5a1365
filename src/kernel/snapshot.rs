use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Snapshot file magic bytes: "SNAP"
pub const SNAPSHOT_MAGIC: [u8; 4] = [0x53, 0x4E, 0x41, 0x50];

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Snapshot header size in bytes.
pub const SNAPSHOT_HEADER_SIZE: usize = 32;

/// Per-entry prefix: tag (1) + payload length (8).
const ENTRY_PREFIX_SIZE: usize = 9;

// =============================================================================
// STATE KIND
// =============================================================================

/// Tag identifying the owner of one snapshot payload.
///
/// Every state machine, the session tracker and the consensus core own
/// exactly one tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum StateKind {
    Transaction = 0,
    IdAllocation = 1,
    Token = 2,
    LockToken = 3,
    Dummy = 4,
    SessionTracker = 5,
    ConsensusCore = 6,
}

impl StateKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StateKind::Transaction),
            1 => Some(StateKind::IdAllocation),
            2 => Some(StateKind::Token),
            3 => Some(StateKind::LockToken),
            4 => Some(StateKind::Dummy),
            5 => Some(StateKind::SessionTracker),
            6 => Some(StateKind::ConsensusCore),
            _ => None,
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Point-in-time image of every state owner at `prev_index`.
///
/// # Layout (32 bytes header + entries + trailer)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("SNAP")
/// 4       2     version
/// 6       2     flags (zero)
/// 8       8     prev_index (i64)
/// 16      8     prev_term (i64)
/// 24      4     entry count
/// 28      4     header_checksum (CRC32C of bytes 0..28)
/// 32      var   entries: tag (1) | length (8) | payload
/// end-4   4     entries_checksum (CRC32C of all entry bytes)
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Last log index reflected in the snapshot.
    pub prev_index: i64,
    /// Term of the entry at `prev_index`.
    pub prev_term: i64,
    states: BTreeMap<StateKind, Vec<u8>>,
}

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot magic")]
    InvalidMagic,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("Header checksum mismatch: expected {expected}, got {actual}")]
    HeaderChecksumMismatch { expected: u32, actual: u32 },

    #[error("Entries checksum mismatch: expected {expected}, got {actual}")]
    EntriesChecksumMismatch { expected: u32, actual: u32 },

    #[error("Snapshot truncated")]
    Truncated,

    #[error("Unknown state tag: {0}")]
    UnknownStateKind(u8),

    #[error("Missing state for {0:?}")]
    MissingState(StateKind),

    #[error("Serialize error: {0}")]
    Serialization(#[from] bincode::Error),
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl Snapshot {
    pub fn new(prev_index: i64, prev_term: i64) -> Self {
        Snapshot {
            prev_index,
            prev_term,
            states: BTreeMap::new(),
        }
    }

    /// Store the raw payload for `kind`, replacing any previous one.
    pub fn add(&mut self, kind: StateKind, payload: Vec<u8>) {
        self.states.insert(kind, payload);
    }

    /// Raw payload for `kind`.
    pub fn get(&self, kind: StateKind) -> Option<&[u8]> {
        self.states.get(&kind).map(|v| v.as_slice())
    }

    /// Serialize `state` under `kind`.
    pub fn add_state<T: Serialize>(&mut self, kind: StateKind, state: &T) -> Result<(), SnapshotError> {
        self.add(kind, bincode::serialize(state)?);
        Ok(())
    }

    /// Deserialize the state stored under `kind`; missing state is an error.
    pub fn state<T: serde::de::DeserializeOwned>(&self, kind: StateKind) -> Result<T, SnapshotError> {
        let payload = self.get(kind).ok_or(SnapshotError::MissingState(kind))?;
        Ok(bincode::deserialize(payload)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + 4);
        out.extend_from_slice(&self.serialize_header());

        let entries_start = out.len();
        for (kind, payload) in &self.states {
            out.push(*kind as u8);
            out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            out.extend_from_slice(payload);
        }
        let entries_checksum = crc32c::crc32c(&out[entries_start..]);
        out.extend_from_slice(&entries_checksum.to_le_bytes());
        out
    }

    fn serialize_header(&self) -> [u8; SNAPSHOT_HEADER_SIZE] {
        let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
        header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
        header[4..6].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        // flags (6..8) stay zero
        header[8..16].copy_from_slice(&self.prev_index.to_le_bytes());
        header[16..24].copy_from_slice(&self.prev_term.to_le_bytes());
        header[24..28].copy_from_slice(&(self.states.len() as u32).to_le_bytes());
        let header_checksum = crc32c::crc32c(&header[0..28]);
        header[28..32].copy_from_slice(&header_checksum.to_le_bytes());
        header
    }

    /// Decode with strict validation: magic, version, both checksums and
    /// every entry length must check out.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < SNAPSHOT_HEADER_SIZE + 4 {
            return Err(SnapshotError::Truncated);
        }
        let header = &bytes[..SNAPSHOT_HEADER_SIZE];

        if header[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let expected = read_u32(header, 28);
        let actual = crc32c::crc32c(&header[0..28]);
        if expected != actual {
            return Err(SnapshotError::HeaderChecksumMismatch { expected, actual });
        }

        let prev_index = read_u64(header, 8) as i64;
        let prev_term = read_u64(header, 16) as i64;
        let count = read_u32(header, 24);

        let entries = &bytes[SNAPSHOT_HEADER_SIZE..bytes.len() - 4];
        let expected = read_u32(bytes, bytes.len() - 4);
        let actual = crc32c::crc32c(entries);
        if expected != actual {
            return Err(SnapshotError::EntriesChecksumMismatch { expected, actual });
        }

        let mut snapshot = Snapshot::new(prev_index, prev_term);
        let mut pos = 0usize;
        for _ in 0..count {
            if entries.len() < pos + ENTRY_PREFIX_SIZE {
                return Err(SnapshotError::Truncated);
            }
            let tag = entries[pos];
            let kind = StateKind::from_byte(tag).ok_or(SnapshotError::UnknownStateKind(tag))?;
            let len = read_u64(entries, pos + 1) as usize;
            pos += ENTRY_PREFIX_SIZE;

            let end = pos.checked_add(len).ok_or(SnapshotError::Truncated)?;
            if entries.len() < end {
                return Err(SnapshotError::Truncated);
            }
            snapshot.add(kind, entries[pos..end].to_vec());
            pos = end;
        }
        if pos != entries.len() {
            return Err(SnapshotError::Truncated);
        }

        Ok(snapshot)
    }

    /// Save snapshot to file atomically (write tmp, fsync, rename).
    pub fn save_to_file(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("snap.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&self.encode())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SnapshotError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::decode(&bytes)
    }

    /// Generate the snapshot filename for a given index.
    pub fn filename_for_index(index: i64) -> String {
        format!("snapshot_{:020}.snap", index.max(0))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new(41, 3);
        snapshot.add(StateKind::Dummy, vec![1, 2, 3]);
        snapshot.add(StateKind::SessionTracker, vec![]);
        snapshot.add_state(StateKind::LockToken, &(7u64, 2u64)).unwrap();
        snapshot
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(Snapshot::filename_for_index(41));
        let snapshot = sample();

        snapshot.save_to_file(&path).unwrap();
        assert!(!path.with_extension("snap.tmp").exists());

        let loaded = Snapshot::load_from_file(&path).unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.state::<(u64, u64)>(StateKind::LockToken).unwrap(), (7, 2));
        assert_eq!(loaded.get(StateKind::SessionTracker), Some(&[][..]));
    }

    #[test]
    fn test_snapshot_invalid_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(Snapshot::decode(&bytes), Err(SnapshotError::InvalidMagic)));
    }

    #[test]
    fn test_snapshot_corrupted_header() {
        let mut bytes = sample().encode();
        bytes[10] ^= 0xFF;
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(SnapshotError::HeaderChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_snapshot_corrupted_payload() {
        let mut bytes = sample().encode();
        let at = SNAPSHOT_HEADER_SIZE + ENTRY_PREFIX_SIZE;
        bytes[at] ^= 0xFF;
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(SnapshotError::EntriesChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_state_is_reported() {
        let snapshot = Snapshot::new(0, 0);
        assert!(matches!(
            snapshot.state::<u64>(StateKind::Token),
            Err(SnapshotError::MissingState(StateKind::Token))
        ));
    }

    #[test]
    fn test_negative_prev_index_survives_encoding() {
        let snapshot = Snapshot::new(-1, -1);
        let decoded = Snapshot::decode(&snapshot.encode()).unwrap();
        assert_eq!(decoded.prev_index, -1);
        assert_eq!(decoded.prev_term, -1);
    }
}
