//! RaftServer - event loop driving timers, proposals and membership

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::RaftConfig;
use super::membership::{ConfChange, PeerInfo, PeerRole};
use super::raft_core::{EntryPayload, ProposalReply, RaftCore, RaftState, RaftStatus};
use super::raft_node::{RaftNode, SharedCore};
use crate::state_machine::ApplyResult;
use crate::store::{Proposer, StoreAction, StoreError};
use crate::transport::{JoinRequest, LeaveRequest, Transport, TransportError};

/// Hops a join or leave request follows toward the leader
const MAX_REDIRECTS: usize = 3;

/// Errors that can occur during Raft operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader {
        leader_hint: Option<u64>,
        leader_addr: Option<String>,
    },
    /// The entry was overwritten or superseded before it committed
    #[error("proposal dropped before commit")]
    ProposalDropped,
    #[error("timed out")]
    Timeout,
    #[error("membership change rejected: {0}")]
    MembershipConflict(String),
    #[error("leadership transfer in progress")]
    TransferInProgress,
    #[error("raft server is shut down")]
    Shutdown,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl RaftError {
    /// True if the same request may succeed later or on another node
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RaftError::MembershipConflict(_) | RaftError::Shutdown)
    }
}

/// Command sent to the RaftServer from handles and RPC handlers
enum Command {
    /// Append an entry; the reply fires once it is applied
    Propose {
        payload: EntryPayload,
        reply: ProposalReply,
    },
    TransferLeadership {
        target: Option<u64>,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    /// Start an election now (leadership handed to this node)
    Campaign,
    ReadBarrier {
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
    JoinCluster {
        addr: String,
        info: PeerInfo,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    LeaveCluster {
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    core: SharedCore,
    applied_rx: watch::Receiver<u64>,
    config: RaftConfig,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Shared core, for serving incoming RPCs
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    async fn send(&self, command: Command) -> Result<(), RaftError> {
        self.command_tx.send(command).await.map_err(|_| RaftError::Shutdown)
    }

    async fn propose_entry(&self, payload: EntryPayload) -> Result<ApplyResult, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Propose { payload, reply }).await?;
        await_reply(rx, self.config.proposal_timeout).await
    }

    /// Replicate one store transaction. Returns the store's verdict once the
    /// entry is applied on this node.
    pub async fn propose(&self, actions: Vec<StoreAction>) -> Result<ApplyResult, RaftError> {
        self.propose_entry(EntryPayload::Proposal(actions)).await
    }

    /// Commit a single membership change
    pub async fn change_membership(&self, change: ConfChange) -> Result<(), RaftError> {
        self.propose_entry(EntryPayload::ConfChange(change))
            .await?
            .map_err(|e| RaftError::MembershipConflict(e.to_string()))
    }

    pub async fn add_member(&self, info: PeerInfo) -> Result<(), RaftError> {
        self.change_membership(ConfChange::AddNode { info, role: PeerRole::Voter }).await
    }

    pub async fn add_learner(&self, info: PeerInfo) -> Result<(), RaftError> {
        self.change_membership(ConfChange::AddNode { info, role: PeerRole::Learner }).await
    }

    pub async fn promote(&self, id: u64) -> Result<(), RaftError> {
        self.change_membership(ConfChange::Promote { id }).await
    }

    pub async fn remove_member(&self, id: u64) -> Result<(), RaftError> {
        self.change_membership(ConfChange::RemoveNode { id }).await
    }

    /// Hand leadership to `target`, or to the most up-to-date voter.
    /// Returns once this node has stepped down.
    pub async fn transfer_leadership(&self, target: Option<u64>) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TransferLeadership { target, reply }).await?;
        let limit = self.config.transfer_timeout + self.config.heartbeat_interval * 2;
        await_reply(rx, limit).await
    }

    /// Wait until every write committed before this call is applied locally.
    /// Only succeeds on the leader. Returns the index that was waited for.
    pub async fn read_barrier(&self) -> Result<u64, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReadBarrier { reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Ask the server to campaign immediately
    pub fn campaign(&self) {
        if self.command_tx.try_send(Command::Campaign).is_err() {
            warn!(node_id = self.id, "campaign request dropped, command queue full");
        }
    }

    /// Join the cluster reachable at `addr`, advertising `advertise_addr` to its members
    pub async fn join_cluster(&self, addr: &str, advertise_addr: &str) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::JoinCluster {
            addr: addr.to_string(),
            info: PeerInfo::new(self.id, advertise_addr),
            reply,
        })
        .await?;
        await_reply(rx, self.config.proposal_timeout).await
    }

    /// Remove this node from the cluster through the leader
    pub async fn leave_cluster(&self) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LeaveCluster { reply }).await?;
        await_reply(rx, self.config.proposal_timeout).await
    }

    pub async fn status(&self) -> RaftStatus {
        self.core.lock().await.status()
    }

    pub async fn is_leader(&self) -> bool {
        self.core.lock().await.state == RaftState::Leader
    }

    /// Wait until this node knows a leader. Returns the leader's ID.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<u64, RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.core.lock().await.current_leader {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until this node has applied `index`
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> Result<(), RaftError> {
        let mut applied = self.applied_rx.clone();
        let reached = tokio::time::timeout(timeout, applied.wait_for(|&a| a >= index))
            .await
            .map(|r| r.is_ok());
        match reached {
            Ok(true) => Ok(()),
            Ok(false) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::Timeout),
        }
    }

    /// Shutdown the RaftServer gracefully
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[async_trait]
impl Proposer for RaftHandle {
    async fn propose_actions(&self, actions: Vec<StoreAction>) -> Result<(), StoreError> {
        self.propose(actions).await?
    }

    async fn read_barrier(&self) -> Result<u64, StoreError> {
        Ok(RaftHandle::read_barrier(self).await?)
    }
}

/// Wait for the server's answer, giving up after `limit`
async fn await_reply<R>(rx: oneshot::Receiver<Result<R, RaftError>>, limit: Duration) -> Result<R, RaftError> {
    match tokio::time::timeout(limit, rx).await {
        Err(_) => Err(RaftError::Timeout),
        Ok(Err(_)) => Err(RaftError::Shutdown),
        Ok(Ok(result)) => result,
    }
}

/// Follow `NotLeader` redirects while calling `rpc` on successive addresses
async fn with_redirects<R, F, Fut>(mut addr: String, mut rpc: F) -> Result<R, RaftError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Result<R, RaftError>, TransportError>>,
{
    for _ in 0..=MAX_REDIRECTS {
        match rpc(addr.clone()).await? {
            Err(RaftError::NotLeader { leader_addr: Some(next), .. }) if next != addr => {
                debug!(from = %addr, to = %next, "following leader redirect");
                addr = next;
            }
            result => return result,
        }
    }
    Err(RaftError::NotLeader { leader_hint: None, leader_addr: None })
}

/// Raft server that handles client commands and coordinates with RaftNode
pub struct RaftServer<T: Transport> {
    id: u64,
    node: Arc<RaftNode<T>>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    applied_rx: watch::Receiver<u64>,
    config: RaftConfig,
    /// Caller waiting for the leadership transfer in progress
    transfer_reply: Option<oneshot::Sender<Result<(), RaftError>>>,
    /// Membership index last pushed to the transport
    synced_membership: Option<u64>,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a new RaftServer with default config
    /// Returns the server and shared core for RPC handling
    pub fn new(core: RaftCore, transport: T) -> (Self, SharedCore) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a new RaftServer with custom config
    /// Returns the server and shared core for RPC handling
    pub fn with_config(mut core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        core.set_snapshot_threshold(config.snapshot_threshold);
        let applied_rx = core.subscribe_applied();
        let id = core.id;
        let (command_tx, command_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = Arc::new(RaftNode::new(core, transport, config.clone()));
        let shared_core = node.shared_core();
        let server = Self {
            id,
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            applied_rx,
            config,
            transfer_reply: None,
            synced_membership: None,
        };
        (server, shared_core)
    }

    /// Handle to a server that has not started yet, e.g. to wire RPC handlers first
    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            id: self.id,
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            core: self.node.shared_core(),
            applied_rx: self.applied_rx.clone(),
            config: self.config.clone(),
        }
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Main server loop
    async fn run(mut self) {
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        // Use Delay behavior to prevent accumulated missed ticks from starving election timeout
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut election_timeout = self.config.random_election_timeout();

        loop {
            self.sync_peers().await;

            // Calculate election deadline based on last_heartbeat from core
            let election_deadline = self.get_election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                // Handle shutdown signal
                _ = self.shutdown_rx.recv() => {
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_commands(cmd).await;
                }
                // Send heartbeats if leader
                _ = heartbeat_interval.tick() => {
                    if self.node.state().await == RaftState::Leader {
                        // Update our own heartbeat timer to prevent election timeout
                        self.node.shared_core().lock().await.last_heartbeat = Instant::now();
                        self.node.replicate().await;
                    }
                }
                // Election timeout - start election if not leader
                _ = election_sleep => {
                    if self.node.state().await != RaftState::Leader
                        && self.has_election_timed_out(election_timeout).await
                    {
                        self.run_election().await;
                        election_timeout = self.config.random_election_timeout();
                    }
                }
                else => break, // All channels closed, shutdown
            }

            self.advance_transfer().await;
        }

        let shared = self.node.shared_core();
        let mut core = shared.lock().await;
        core.fail_pending(RaftError::Shutdown);
        if let Some(reply) = self.transfer_reply.take() {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        info!(node_id = core.id, term = core.current_term, "raft server stopped");
    }

    /// Handle `first` and any commands queued behind it. Consecutive
    /// proposals share one replication round.
    async fn handle_commands(&mut self, first: Command) {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                Command::Propose { payload, reply } => {
                    let mut batch = 1;
                    {
                        let shared = self.node.shared_core();
                        let mut core = shared.lock().await;
                        core.propose(payload, reply);
                        while batch < self.config.max_proposal_batch {
                            match self.command_rx.try_recv() {
                                Ok(Command::Propose { payload, reply }) => {
                                    core.propose(payload, reply);
                                    batch += 1;
                                }
                                Ok(other) => {
                                    next = Some(other);
                                    break;
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    debug!(batch, "proposals appended");
                    self.node.replicate().await;
                }
                Command::TransferLeadership { target, reply } => self.begin_transfer(target, reply).await,
                Command::Campaign => {
                    if self.node.state().await != RaftState::Leader {
                        self.run_election().await;
                    }
                }
                Command::ReadBarrier { reply } => self.read_barrier(reply).await,
                Command::JoinCluster { addr, info, reply } => {
                    let node = self.node.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(join_cluster(node, addr, info).await);
                    });
                }
                Command::LeaveCluster { reply } => self.leave_cluster(reply).await,
            }
        }
    }

    /// Campaign if this node is allowed to
    async fn run_election(&self) {
        let shared = self.node.shared_core();
        {
            let mut core = shared.lock().await;
            if !core.can_campaign() {
                // Not a voter: wait for the leader instead of spinning on the timer
                core.last_heartbeat = Instant::now();
                return;
            }
        }

        let won = self.node.start_election().await || self.node.request_votes().await;
        if won {
            // Immediately send heartbeat to establish leadership
            self.node.replicate().await;
        }
    }

    async fn begin_transfer(&mut self, target: Option<u64>, reply: oneshot::Sender<Result<(), RaftError>>) {
        let begun = {
            let shared = self.node.shared_core();
            let mut core = shared.lock().await;
            core.begin_transfer(target, self.config.transfer_timeout)
        };
        match begun {
            Ok(_) => {
                self.transfer_reply = Some(reply);
                // Bring the target up to date without waiting for the next tick
                self.node.replicate().await;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Move the leadership transfer along: send TimeoutNow once the target is
    /// caught up, give up after the deadline, answer the caller when done
    async fn advance_transfer(&mut self) {
        let shared = self.node.shared_core();
        let (transfer, ready, state, leader) = {
            let core = shared.lock().await;
            (core.transfer(), core.transfer_ready(), core.state, core.current_leader)
        };

        match transfer {
            None => {
                if let Some(reply) = self.transfer_reply.take() {
                    let result = if state == RaftState::Leader { Err(RaftError::Timeout) } else { Ok(()) };
                    info!(new_leader = ?leader, ok = result.is_ok(), "leadership transfer finished");
                    let _ = reply.send(result);
                }
            }
            Some((_, deadline)) if Instant::now() >= deadline => {
                shared.lock().await.abort_transfer();
                if let Some(reply) = self.transfer_reply.take() {
                    let _ = reply.send(Err(RaftError::Timeout));
                }
            }
            Some(_) => {
                if let Some(target) = ready {
                    shared.lock().await.set_timeout_sent(true);
                    if self.node.send_timeout_now(target).await {
                        info!(target, "sent timeout-now to transfer target");
                    } else {
                        shared.lock().await.set_timeout_sent(false);
                    }
                }
            }
        }
    }

    async fn read_barrier(&self, reply: oneshot::Sender<Result<u64, RaftError>>) {
        let (term, read_index) = {
            let shared = self.node.shared_core();
            let core = shared.lock().await;
            if core.state != RaftState::Leader {
                let _ = reply.send(Err(core.not_leader()));
                return;
            }
            (core.current_term, core.read_index())
        };

        let node = self.node.clone();
        let mut applied = self.applied_rx.clone();
        let timeout = self.config.proposal_timeout;
        tokio::spawn(async move {
            let result = if node.confirm_leadership(term).await {
                let reached = tokio::time::timeout(timeout, applied.wait_for(|&a| a >= read_index))
                    .await
                    .map(|r| r.is_ok());
                match reached {
                    Ok(true) => Ok(read_index),
                    Ok(false) => Err(RaftError::Shutdown),
                    Err(_) => Err(RaftError::Timeout),
                }
            } else {
                Err(node.shared_core().lock().await.not_leader())
            };
            let _ = reply.send(result);
        });
    }

    async fn leave_cluster(&self, reply: oneshot::Sender<Result<(), RaftError>>) {
        let shared = self.node.shared_core();
        let mut core = shared.lock().await;
        let id = core.id;

        if core.state == RaftState::Leader {
            let (tx, rx) = oneshot::channel();
            core.propose(EntryPayload::ConfChange(ConfChange::RemoveNode { id }), tx);
            drop(core);
            self.node.replicate().await;
            tokio::spawn(async move {
                let result = match rx.await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(e))) => Err(RaftError::MembershipConflict(e.to_string())),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(RaftError::Shutdown),
                };
                let _ = reply.send(result);
            });
            return;
        }

        let leader_addr = match core.not_leader() {
            RaftError::NotLeader { leader_addr: Some(addr), .. } => addr,
            other => {
                let _ = reply.send(Err(other));
                return;
            }
        };
        drop(core);

        let node = self.node.clone();
        tokio::spawn(async move {
            let result = with_redirects(leader_addr, |addr| {
                let node = node.clone();
                async move { node.transport().leave_cluster(&addr, LeaveRequest { id }).await }
            })
            .await;
            if result.is_ok() {
                info!(node_id = id, "left cluster");
            }
            let _ = reply.send(result);
        });
    }

    /// Push committed membership to the transport when it changes
    async fn sync_peers(&mut self) {
        let (index, peers) = {
            let shared = self.node.shared_core();
            let core = shared.lock().await;
            let index = core.membership_index();
            if self.synced_membership == Some(index) {
                return;
            }
            let peers: Vec<PeerInfo> = core.membership().members().map(|m| m.info.clone()).collect();
            (index, peers)
        };
        self.node.transport().sync_peers(&peers);
        self.synced_membership = Some(index);
    }

    /// Get election deadline based on last_heartbeat from core
    async fn get_election_deadline(&self, timeout: Duration) -> Instant {
        let core = self.node.shared_core();
        let last_heartbeat = core.lock().await.last_heartbeat;
        last_heartbeat + timeout
    }

    /// Check if election has actually timed out (last_heartbeat + timeout < now)
    async fn has_election_timed_out(&self, timeout: Duration) -> bool {
        let core = self.node.shared_core();
        let last_heartbeat = core.lock().await.last_heartbeat;
        Instant::now() >= last_heartbeat + timeout
    }
}

/// Ask the cluster at `addr` to admit `info`, then adopt what the leader sent back
async fn join_cluster<T: Transport>(node: Arc<RaftNode<T>>, addr: String, info: PeerInfo) -> Result<(), RaftError> {
    let id = info.id;
    let accepted = with_redirects(addr, |addr| {
        let node = node.clone();
        let info = info.clone();
        async move { node.transport().join_cluster(&addr, JoinRequest { info }).await }
    })
    .await?;

    let peers: Vec<PeerInfo> = accepted.membership.members().map(|m| m.info.clone()).collect();
    node.transport().sync_peers(&peers);

    let shared = node.shared_core();
    let mut core = shared.lock().await;
    if core.current_leader.is_none() {
        core.current_leader = Some(accepted.leader_id);
    }
    if let Some(snapshot) = accepted.snapshot {
        // The leader ships the snapshot itself if this fails
        if let Err(e) = core.install_snapshot(snapshot) {
            warn!(node_id = id, error = %e, "could not install snapshot from join reply");
        }
    }
    info!(node_id = id, leader = accepted.leader_id, members = peers.len(), "joined cluster");
    Ok(())
}
