//! In-memory storage implementation for testing
//!
//! Fast, no side effects, no persistence across restarts.

use crate::core::raft_core::LogEntry;
use crate::core::snapshot::Snapshot;
use super::{HardState, Storage, StorageError};

/// In-memory storage implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    hard_state: HardState,
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        Ok(self.hard_state)
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.hard_state = *state;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.log.clone())
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError> {
        self.log.retain(|e| e.index >= before_index);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
