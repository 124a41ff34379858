//! Raft consensus: the synchronous core, its async driver and the server loop

pub mod config;
pub mod membership;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
pub mod snapshot;

pub use config::RaftConfig;
pub use membership::{ConfChange, Member, Membership, PeerInfo, PeerRole};
pub use raft_core::{EntryPayload, LogEntry, RaftCore, RaftState, RaftStatus};
pub use raft_node::{RaftNode, SharedCore};
pub use raft_server::{RaftError, RaftHandle, RaftServer};
pub use snapshot::{Snapshot, SnapshotMetadata};
