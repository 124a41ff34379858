//! State machine abstraction for Raft
//!
//! The state machine is the application logic that Raft coordinates.
//! When log entries are committed, their store actions are applied here.

use crate::store::{StoreAction, StoreError};

/// Outcome of applying one committed entry.
///
/// An `Err` is deterministic: every node rejects the same entry the same way,
/// so it is reported to the proposer rather than treated as a node failure.
pub type ApplyResult = Result<(), StoreError>;

/// State machine trait - the application logic that Raft coordinates
///
/// Implementations must be deterministic: applying the same actions
/// in the same order must produce the same state on all nodes.
pub trait StateMachine: Send {
    /// Apply the actions of the entry at `index`, all or nothing
    fn apply(&mut self, index: u64, actions: &[StoreAction]) -> ApplyResult;
}

/// Snapshotable state machine - supports log compaction
pub trait Snapshotable: StateMachine {
    /// Serialize the current state
    fn snapshot(&self) -> Result<Vec<u8>, StoreError>;

    /// Replace the current state with a snapshot taken at `index`
    fn restore(&mut self, data: &[u8], index: u64) -> Result<(), StoreError>;
}
