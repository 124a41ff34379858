//! Replicated object store
//!
//! Reads run against immutable snapshots. Writes are staged in a `WriteTx`,
//! turned into a list of `StoreAction`s and handed to a `Proposer`; the store
//! only changes when the consensus layer applies the committed entry.

pub mod cluster;
pub mod index;
pub mod memory;
pub mod object;
pub mod tx;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::raft_server::RaftError;

pub use cluster::{wait_for_cluster, DEFAULT_CLUSTER_NAME};
pub use index::{By, IndexKey, Table};
pub use memory::MemoryStore;
pub use object::{
    Annotations, Cluster, Meta, Network, Node, NodeMembership, NodeRole, Object, ObjectKind,
    Service, Task, TaskState,
};
pub use tx::{ReadTx, StoreRead, WriteTx};

/// One mutation carried in a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreAction {
    Create(Object),
    /// Replace an object; its `meta.version` must match the stored version
    Update(Object),
    Delete { kind: ObjectKind, id: String },
}

impl StoreAction {
    pub fn kind(&self) -> ObjectKind {
        match self {
            StoreAction::Create(o) | StoreAction::Update(o) => o.kind(),
            StoreAction::Delete { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            StoreAction::Create(o) | StoreAction::Update(o) => o.id(),
            StoreAction::Delete { id, .. } => id,
        }
    }
}

/// Errors surfaced to store callers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: ObjectKind, id: String },

    #[error("{kind} {id} already exists")]
    Exists { kind: ObjectKind, id: String },

    #[error("{kind} name {name:?} is already in use")]
    NameConflict { kind: ObjectKind, name: String },

    #[error("{kind} {id} was modified concurrently (expected version {expected}, found {actual})")]
    SequenceConflict {
        kind: ObjectKind,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("store has no proposer attached")]
    NoProposer,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Raft(#[from] RaftError),
}

impl StoreError {
    /// Whether re-running the transaction may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::SequenceConflict { .. } => true,
            StoreError::Raft(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Sink for staged transactions, implemented by the consensus handle
#[async_trait]
pub trait Proposer: Send + Sync {
    /// Replicate `actions` as one log entry and wait until it is applied locally
    async fn propose_actions(&self, actions: Vec<StoreAction>) -> Result<(), StoreError>;

    /// Confirm leadership and wait until everything committed so far is applied.
    /// Returns the index the local store has caught up to.
    async fn read_barrier(&self) -> Result<u64, StoreError>;
}
