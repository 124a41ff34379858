//! RaftNode - async RPC fan-out around the synchronous core

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::RaftConfig;
use super::raft_core::{
    RaftCore, RaftState, ReplicationRequest, RequestVoteArgs, TimeoutNowArgs,
};
use crate::transport::{Transport, TransportError};

/// Shared reference to RaftCore
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// Consecutive failures talking to one peer
#[derive(Debug, Clone, Copy)]
struct PeerBackoff {
    failures: u32,
    retry_at: Instant,
}

/// High-level Raft node that handles consensus operations
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
    config: RaftConfig,
    backoff: parking_lot::Mutex<HashMap<u64, PeerBackoff>>,
}

impl<T: Transport> RaftNode<T> {
    pub fn new(core: RaftCore, transport: T, config: RaftConfig) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
            config,
            backoff: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run `rpc` with the configured deadline
    async fn call<R>(&self, rpc: impl Future<Output = Result<R, TransportError>>) -> Result<R, TransportError> {
        tokio::time::timeout(self.config.rpc_timeout, rpc)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    fn backed_off(&self, peer_id: u64, now: Instant) -> bool {
        self.backoff.lock().get(&peer_id).is_some_and(|b| b.retry_at > now)
    }

    fn record_success(&self, peer_id: u64) {
        if let Some(b) = self.backoff.lock().remove(&peer_id) {
            info!(peer = peer_id, failures = b.failures, "peer reachable again");
        }
    }

    fn record_failure(&self, peer_id: u64, err: &TransportError) {
        let mut backoff = self.backoff.lock();
        let entry = backoff.entry(peer_id).or_insert(PeerBackoff { failures: 0, retry_at: Instant::now() });
        entry.failures = entry.failures.saturating_add(1);
        let delay = self.config.backoff_delay(entry.failures);
        entry.retry_at = Instant::now() + delay;
        if entry.failures == 1 {
            warn!(peer = peer_id, error = %err, "peer unreachable, backing off");
        } else {
            debug!(peer = peer_id, failures = entry.failures, delay_ms = delay.as_millis() as u64, "peer still unreachable");
        }
    }

    /// Start an election. Returns true if this node won outright.
    pub async fn start_election(&self) -> bool {
        let mut core = self.core.lock().await;
        core.start_election()
    }

    /// Request votes from all voting peers (sends requests concurrently)
    /// Returns true if became leader
    pub async fn request_votes(&self) -> bool {
        let (args, peers) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Candidate {
                return core.state == RaftState::Leader;
            }
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.voting_peers())
        };

        // Send all vote requests concurrently, process as they arrive
        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                async move { (peer_id, self.call(self.transport.request_vote(peer_id, args)).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    if core.handle_request_vote_result(peer_id, &result) {
                        return true; // Became leader, don't wait for remaining
                    }
                    if core.state != RaftState::Candidate {
                        return false;
                    }
                }
                Err(e) => debug!(peer = peer_id, error = %e, "vote request failed"),
            }
        }

        false
    }

    /// One replication round: send every reachable peer the entries (or
    /// snapshot) it is missing. Heartbeats are rounds with nothing to send.
    /// Returns true if the commit index advanced.
    pub async fn replicate(&self) -> bool {
        let now = Instant::now();
        let requests: Vec<(u64, ReplicationRequest)> = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return false;
            }
            core.peers()
                .into_iter()
                .filter(|&peer_id| !self.backed_off(peer_id, now))
                .filter_map(|peer_id| {
                    core.replication_request(peer_id, self.config.max_append_entries)
                        .map(|req| (peer_id, req))
                })
                .collect()
        };

        enum Reply {
            Append(Result<super::raft_core::AppendEntriesResult, TransportError>),
            Snapshot(u64, Result<super::raft_core::InstallSnapshotResult, TransportError>),
        }

        // Send to all peers concurrently (lock released)
        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, request)| async move {
                let reply = match request {
                    ReplicationRequest::Append(args) => {
                        Reply::Append(self.call(self.transport.append_entries(peer_id, args)).await)
                    }
                    ReplicationRequest::Snapshot(args) => {
                        let last_included_index = args.last_included_index;
                        debug!(peer = peer_id, index = last_included_index, "sending snapshot");
                        Reply::Snapshot(
                            last_included_index,
                            self.call(self.transport.install_snapshot(peer_id, args)).await,
                        )
                    }
                };
                (peer_id, reply)
            })
            .collect();

        // Wait for every peer so higher terms are noticed and laggards catch up
        let mut advanced = false;
        while let Some((peer_id, reply)) = futures.next().await {
            match reply {
                Reply::Append(Ok(result)) => {
                    self.record_success(peer_id);
                    advanced |= self.core.lock().await.handle_append_entries_result(peer_id, &result);
                }
                Reply::Snapshot(index, Ok(result)) => {
                    self.record_success(peer_id);
                    advanced |= self
                        .core
                        .lock()
                        .await
                        .handle_install_snapshot_result(peer_id, index, &result);
                }
                Reply::Append(Err(e)) | Reply::Snapshot(_, Err(e)) => self.record_failure(peer_id, &e),
            }
        }
        advanced
    }

    /// Confirm this node is still leader for `term` by exchanging heartbeats
    /// with a quorum of voters. Returns as soon as a quorum answers, without
    /// waiting for slow/dead peers. Used by the read barrier.
    pub async fn confirm_leadership(&self, term: u64) -> bool {
        let (requests, quorum) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader || core.current_term != term {
                return false;
            }
            let requests: Vec<_> = core
                .voting_peers()
                .into_iter()
                .map(|peer_id| (peer_id, core.heartbeat_request(peer_id)))
                .collect();
            (requests, core.membership().quorum())
        };

        // This node counts as one acknowledgement
        let mut acks = 1;
        if acks >= quorum {
            return true;
        }

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args)| async move {
                (peer_id, self.call(self.transport.append_entries(peer_id, args)).await)
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            let Ok(result) = result else { continue };
            let mut core = self.core.lock().await;
            // A rejected append from the same term still acknowledges our leadership
            if result.term == term {
                acks += 1;
            }
            core.handle_append_entries_result(peer_id, &result);
            if core.state != RaftState::Leader || core.current_term != term {
                return false;
            }
            if acks >= quorum {
                return true;
            }
        }
        false
    }

    /// Tell `target` to campaign immediately. Returns true if it agreed.
    pub async fn send_timeout_now(&self, target: u64) -> bool {
        let args = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return false;
            }
            TimeoutNowArgs { term: core.current_term, leader_id: core.id }
        };

        match self.call(self.transport.timeout_now(target, args)).await {
            Ok(result) => {
                if result.term > self.core.lock().await.current_term {
                    return false;
                }
                result.accepted
            }
            Err(e) => {
                warn!(peer = target, error = %e, "timeout-now failed");
                false
            }
        }
    }

    /// Time until the backoff for `peer_id` expires, if it is backed off
    pub fn backoff_remaining(&self, peer_id: u64) -> Option<Duration> {
        let now = Instant::now();
        self.backoff
            .lock()
            .get(&peer_id)
            .filter(|b| b.retry_at > now)
            .map(|b| b.retry_at - now)
    }

    /// Get current state
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Get commit index
    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }
}
