pub mod cache;
pub mod errors;
pub mod log;
pub mod reader;
pub mod storage;

pub use cache::{ConsecutiveInFlightCache, InFlightCache};
pub use errors::{LogError, ReadError, StorageError};
pub use log::{EntryCursor, InMemoryLog, LogEntry, ReplicatedContent, ReplicatedLog, NOTHING};
pub use reader::LogEntryReader;
pub use storage::{FileStateStorage, InMemoryStateStorage, StateStorage};
