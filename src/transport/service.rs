//! Receiving side of the peer RPCs, shared by every transport

use tracing::{debug, info};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, RaftStatus,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftError, RaftHandle};
use crate::core::RaftState;
use super::{JoinAccepted, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse};

/// Dispatches incoming RPCs to a node's core, and to its server for
/// requests that need a proposal or an election
#[derive(Clone)]
pub struct RaftService {
    core: SharedCore,
    handle: Option<RaftHandle>,
}

impl RaftService {
    pub fn new(handle: RaftHandle) -> Self {
        Self { core: handle.shared_core(), handle: Some(handle) }
    }

    /// Service for a core without a running server. Join, leave and
    /// timeout-now are refused.
    pub fn core_only(core: SharedCore) -> Self {
        Self { core, handle: None }
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteResult {
        self.core.lock().await.handle_request_vote(&args)
    }

    pub async fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesResult {
        self.core.lock().await.handle_append_entries(&args).result
    }

    pub async fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotResult {
        self.core.lock().await.handle_install_snapshot(&args)
    }

    pub async fn timeout_now(&self, args: TimeoutNowArgs) -> TimeoutNowResult {
        let mut result = self.core.lock().await.handle_timeout_now(&args);
        match &self.handle {
            Some(handle) if result.accepted => handle.campaign(),
            _ => result.accepted = false,
        }
        result
    }

    /// Add the caller as a voter once this node, as leader, commits the change
    pub async fn join(&self, req: JoinRequest) -> JoinResponse {
        let handle = self.handle.as_ref().ok_or(RaftError::Shutdown)?;
        let info = req.info;
        let already_member = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return Err(core.not_leader());
            }
            core.membership().get(info.id).is_some_and(|m| m.info == info)
        };

        if already_member {
            // A retried join after the change already committed
            debug!(peer = info.id, "join from existing member");
        } else {
            handle.add_member(info.clone()).await?;
        }

        let core = self.core.lock().await;
        info!(node_id = core.id, peer = info.id, addr = %info.addr, "admitted new member");
        Ok(JoinAccepted {
            leader_id: core.id,
            membership: core.membership().clone(),
            snapshot: core.load_snapshot().ok().flatten(),
        })
    }

    pub async fn leave(&self, req: LeaveRequest) -> LeaveResponse {
        let handle = self.handle.as_ref().ok_or(RaftError::Shutdown)?;
        handle.remove_member(req.id).await?;
        info!(peer = req.id, "member left");
        Ok(())
    }

    pub async fn status(&self) -> RaftStatus {
        self.core.lock().await.status()
    }
}
