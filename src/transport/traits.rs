//! Transport abstraction for Raft RPC communication

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::membership::{Membership, PeerInfo};
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};
use crate::core::raft_server::RaftError;
use crate::core::snapshot::Snapshot;

/// A node asking to be added to the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub info: PeerInfo,
}

/// What a joining node needs to start following the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAccepted {
    pub leader_id: u64,
    /// Membership after the join committed
    pub membership: Membership,
    /// Latest snapshot on the leader, if it has compacted its log
    pub snapshot: Option<Snapshot>,
}

pub type JoinResponse = Result<JoinAccepted, RaftError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: u64,
}

pub type LeaveResponse = Result<(), RaftError>;

/// Transport abstraction for Raft RPC communication
///
/// Peer RPCs address a member by ID. Join and leave address a node by its
/// advertised address since the caller may not be a member yet.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Send an InstallSnapshot RPC to a peer node
    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;

    /// Tell a fully caught-up peer to start an election now
    async fn timeout_now(
        &self,
        target: u64,
        args: TimeoutNowArgs,
    ) -> Result<TimeoutNowResult, TransportError>;

    async fn join_cluster(&self, addr: &str, req: JoinRequest) -> Result<JoinResponse, TransportError>;

    async fn leave_cluster(&self, addr: &str, req: LeaveRequest) -> Result<LeaveResponse, TransportError>;

    /// Called whenever committed membership changes
    fn sync_peers(&self, _peers: &[PeerInfo]) {}
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("node not found")]
    NodeNotFound,
    /// Peer rejected our cluster token
    #[error("unauthorized")]
    Unauthorized,
    #[error("malformed message: {0}")]
    Codec(String),
}
