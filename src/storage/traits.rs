//! Storage abstraction for Raft persistent state
//!
//! Raft requires certain state to be persisted to stable storage before
//! responding to RPCs: the hard state (term, vote, commit) and log entries.

use serde::{Deserialize, Serialize};

use crate::core::raft_core::LogEntry;
use crate::core::snapshot::Snapshot;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Encoding a record failed
    #[error("encoding error: {0}")]
    Codec(String),
    /// Storage not initialized
    #[error("storage not initialized")]
    NotInitialized,
}

/// The single durable record of election and commit progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term this node has seen
    pub term: u64,
    /// Candidate voted for in `term`
    pub voted_for: Option<u64>,
    /// Highest index known to be committed
    pub commit: u64,
}

/// Storage trait for Raft persistent state
///
/// Implementations must ensure durability - data must survive crashes.
/// All operations are synchronous to simplify the RaftCore logic.
pub trait Storage: Send {
    /// Load the hard state; a fresh store returns `HardState::default()`
    fn load_hard_state(&self) -> Result<HardState, StorageError>;

    /// Replace the hard state. Must be durable before returning.
    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError>;

    /// Load all log entries not covered by the snapshot
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after any existing entries
    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove all entries with index >= from_index
    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError>;

    /// Remove all entries with index < before_index
    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError>;

    /// Load the most recent snapshot, if any
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Save a snapshot. Must be durable before returning.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}
