//! In-memory transport implementation for testing
//!
//! Every node registers a `RaftService` with a shared `InMemoryNetwork`.
//! RPCs are direct async calls into the target's service; the network can
//! isolate nodes or cut individual links to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::service::RaftService;
use super::{JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, Transport, TransportError};
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};
use crate::core::raft_node::SharedCore;

const ADDR_PREFIX: &str = "mem://";

#[derive(Default)]
struct NetworkState {
    services: HashMap<u64, RaftService>,
    /// Nodes cut off from everyone
    isolated: HashSet<u64>,
    /// Individual links cut in both directions, stored as (low, high)
    cut: HashSet<(u64, u64)>,
}

impl NetworkState {
    fn link_up(&self, a: u64, b: u64) -> bool {
        !self.isolated.contains(&a) && !self.isolated.contains(&b) && !self.cut.contains(&(a.min(b), a.max(b)))
    }
}

/// Registry of in-process nodes. Cloning shares the network.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address under which node `id` is reachable
    pub fn addr(id: u64) -> String {
        format!("{}{}", ADDR_PREFIX, id)
    }

    fn parse_addr(addr: &str) -> Result<u64, TransportError> {
        addr.strip_prefix(ADDR_PREFIX)
            .and_then(|id| id.parse().ok())
            .ok_or(TransportError::NodeNotFound)
    }

    /// Make `service` reachable as node `id`, replacing any previous registration
    pub fn register(&self, id: u64, service: RaftService) {
        self.state.write().services.insert(id, service);
    }

    /// Serve a bare core (no server loop) as node `id`
    pub fn register_core(&self, id: u64, core: SharedCore) {
        self.register(id, RaftService::core_only(core));
    }

    /// Remove node `id`, as if its process died
    pub fn unregister(&self, id: u64) {
        self.state.write().services.remove(&id);
    }

    /// Transport used by node `id` to reach the others
    pub fn transport(&self, id: u64) -> InMemoryTransport {
        InMemoryTransport { id, network: self.clone() }
    }

    /// Drop all traffic to and from `id`
    pub fn isolate(&self, id: u64) {
        self.state.write().isolated.insert(id);
    }

    pub fn heal(&self, id: u64) {
        self.state.write().isolated.remove(&id);
    }

    /// Drop traffic between `a` and `b` only
    pub fn disconnect(&self, a: u64, b: u64) {
        self.state.write().cut.insert((a.min(b), a.max(b)));
    }

    pub fn reconnect(&self, a: u64, b: u64) {
        self.state.write().cut.remove(&(a.min(b), a.max(b)));
    }

    /// Restore every node and link
    pub fn heal_all(&self) {
        let mut state = self.state.write();
        state.isolated.clear();
        state.cut.clear();
    }

    fn route(&self, from: u64, to: u64) -> Result<RaftService, TransportError> {
        let state = self.state.read();
        if !state.link_up(from, to) {
            return Err(TransportError::ConnectionFailed);
        }
        state.services.get(&to).cloned().ok_or(TransportError::NodeNotFound)
    }
}

/// In-memory transport for one node
#[derive(Clone)]
pub struct InMemoryTransport {
    id: u64,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    fn route(&self, target: u64) -> Result<RaftService, TransportError> {
        self.network.route(self.id, target)
    }

    fn route_addr(&self, addr: &str) -> Result<RaftService, TransportError> {
        self.route(InMemoryNetwork::parse_addr(addr)?)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        Ok(self.route(target)?.request_vote(args).await)
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        Ok(self.route(target)?.append_entries(args).await)
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        Ok(self.route(target)?.install_snapshot(args).await)
    }

    async fn timeout_now(
        &self,
        target: u64,
        args: TimeoutNowArgs,
    ) -> Result<TimeoutNowResult, TransportError> {
        Ok(self.route(target)?.timeout_now(args).await)
    }

    async fn join_cluster(&self, addr: &str, req: JoinRequest) -> Result<JoinResponse, TransportError> {
        Ok(self.route_addr(addr)?.join(req).await)
    }

    async fn leave_cluster(&self, addr: &str, req: LeaveRequest) -> Result<LeaveResponse, TransportError> {
        Ok(self.route_addr(addr)?.leave(req).await)
    }
}
