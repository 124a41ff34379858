//! Raft Consensus Algorithm Implementation
//!
//! This module implements the Raft consensus protocol as described in:
//! "In Search of an Understandable Consensus Algorithm" by Diego Ongaro and John Ousterhout
//!
//! `RaftCore` is synchronous and transport-agnostic. It owns the replicated log,
//! the hard state, the committed membership and the state machine the log is
//! applied to. Async fan-out lives in `RaftNode`, timers in `RaftServer`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::membership::{ConfChange, Membership, PeerInfo, PeerRole};
use super::raft_server::RaftError;
use super::snapshot::{Snapshot, SnapshotMetadata};
use crate::state_machine::{ApplyResult, Snapshotable};
use crate::storage::{HardState, Storage, StorageError};
use crate::store::StoreAction;

/// Raft node states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Follower: Passive state, receives updates from leader
    Follower,
    /// Candidate: Actively seeking votes to become leader
    Candidate,
    /// Leader: Handles all proposals and replicates log
    Leader,
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader so earlier-term entries can commit
    Noop,
    /// One store transaction
    Proposal(Vec<StoreAction>),
    /// One membership transition
    ConfChange(ConfChange),
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when entry was received by leader
    pub term: u64,
    /// Index in the log (1-indexed)
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn noop(term: u64, index: u64) -> Self {
        Self { term, index, payload: EntryPayload::Noop }
    }

    pub fn is_conf_change(&self) -> bool {
        matches!(self.payload, EntryPayload::ConfChange(_))
    }
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting vote
    pub candidate_id: u64,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for candidate to update itself
    pub term: u64,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: u64,
    /// Term of prev_log_index entry
    pub prev_log_term: u64,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: u64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for leader to update itself
    pub term: u64,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// On success, the last index now known to match the leader.
    /// On failure, the highest index the leader should try next.
    pub match_index: u64,
}

/// Result of handling an AppendEntries RPC
#[derive(Debug, Clone)]
pub struct HandleAppendEntriesOutput {
    /// The response to send back to the leader
    pub result: AppendEntriesResult,
    /// Leader ID if we recognized a valid leader
    pub leader_id: Option<u64>,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Last log index included in snapshot
    pub last_included_index: u64,
    /// Term of last included entry
    pub last_included_term: u64,
    /// Membership as of the snapshot
    pub membership: Membership,
    /// Snapshot data
    #[serde(with = "super::snapshot::blob")]
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstallSnapshotResult {
    /// Snapshot was installed, or the follower already had everything it covers
    Success { term: u64 },
    /// Snapshot installation failed
    Failed { term: u64, reason: String },
}

/// TimeoutNow RPC arguments, sent by a leader handing off leadership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowArgs {
    pub term: u64,
    pub leader_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowResult {
    pub term: u64,
    /// True if the receiver will start an election immediately
    pub accepted: bool,
}

/// Next message a leader should send to bring one peer up to date
#[derive(Debug, Clone)]
pub enum ReplicationRequest {
    Append(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

/// Point-in-time summary of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: u64,
    pub state: RaftState,
    pub term: u64,
    pub leader: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub membership: Membership,
}

/// Channel on which a proposer learns the outcome of its entry
pub type ProposalReply = oneshot::Sender<Result<ApplyResult, RaftError>>;

struct PendingProposal {
    term: u64,
    reply: ProposalReply,
}

struct LeaderTransfer {
    target: u64,
    deadline: Instant,
    timeout_sent: bool,
}

/// Core Raft state machine (sync, transport-agnostic)
pub struct RaftCore {
    storage: Box<dyn Storage>,
    state_machine: Box<dyn Snapshotable>,

    // Persistent state, cached in memory and written through `storage`
    /// Latest term server has seen (initialized to 0 on first boot, increases monotonically)
    pub current_term: u64,
    /// Candidate ID that received vote in current term (or None if none)
    pub voted_for: Option<u64>,
    /// Log entries after the snapshot (log[0] is entry snapshot_last_index + 1)
    pub log: Vec<LogEntry>,
    /// Last log index included in snapshot (0 if no snapshot)
    pub snapshot_last_index: u64,
    /// Term of the last log entry included in snapshot (0 if no snapshot)
    pub snapshot_last_term: u64,

    // Volatile state on all servers
    /// Index of highest log entry known to be committed (increases monotonically)
    pub commit_index: u64,
    /// Index of highest log entry applied to state machine (increases monotonically)
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    /// For each peer, index of next log entry to send
    pub next_index: HashMap<u64, u64>,
    /// For each peer, index of highest log entry known to be replicated
    pub match_index: HashMap<u64, u64>,

    /// Unique identifier for this node
    pub id: u64,
    /// Current state of this node
    pub state: RaftState,
    /// Committed configuration
    membership: Membership,
    /// Index of the entry that produced `membership`
    membership_index: u64,
    /// Peers that have granted votes in the current election (used by candidates)
    votes_received: HashSet<u64>,
    /// Current known leader (updated when receiving valid AppendEntries)
    pub current_leader: Option<u64>,
    /// Last time we received a valid heartbeat from leader (for election timeout)
    pub last_heartbeat: Instant,
    /// Number of applied log entries before triggering automatic snapshot (0 = disabled)
    snapshot_threshold: u64,

    /// Index of the uncommitted membership change, if any (leaders only)
    pending_conf_index: Option<u64>,
    /// Index of the no-op this leader appended on election
    term_start_index: u64,
    pending: HashMap<u64, PendingProposal>,
    transfer: Option<LeaderTransfer>,
    applied_tx: watch::Sender<u64>,
}

impl RaftCore {
    /// Create a Raft core from whatever `storage` holds.
    ///
    /// Restores the snapshot into the state machine and replays committed log
    /// entries after it. Fails on unreadable or inconsistent storage.
    pub fn new(
        id: u64,
        storage: Box<dyn Storage>,
        mut state_machine: Box<dyn Snapshotable>,
    ) -> Result<Self, StorageError> {
        let hard_state = storage.load_hard_state()?;
        let mut log = storage.load_log()?;

        let mut membership = Membership::new();
        let (mut snapshot_last_index, mut snapshot_last_term) = (0, 0);
        if let Some(snapshot) = storage.load_snapshot()? {
            snapshot_last_index = snapshot.metadata.last_included_index;
            snapshot_last_term = snapshot.metadata.last_included_term;
            membership = snapshot.metadata.membership;
            state_machine
                .restore(&snapshot.data, snapshot_last_index)
                .map_err(|e| StorageError::Corruption(format!("cannot restore snapshot: {}", e)))?;
        }

        // An interrupted compaction can leave entries the snapshot already covers
        log.retain(|e| e.index > snapshot_last_index);
        for (offset, entry) in log.iter().enumerate() {
            if entry.index != snapshot_last_index + 1 + offset as u64 {
                return Err(StorageError::Corruption(format!(
                    "log gap: expected index {}, found {}",
                    snapshot_last_index + 1 + offset as u64,
                    entry.index
                )));
            }
        }

        let (applied_tx, _) = watch::channel(snapshot_last_index);
        let mut core = RaftCore {
            storage,
            state_machine,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            snapshot_last_index,
            snapshot_last_term,
            commit_index: snapshot_last_index,
            last_applied: snapshot_last_index,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            membership,
            membership_index: snapshot_last_index,
            votes_received: HashSet::new(),
            current_leader: None,
            last_heartbeat: Instant::now(),
            snapshot_threshold: 1000,
            pending_conf_index: None,
            term_start_index: 0,
            pending: HashMap::new(),
            transfer: None,
            applied_tx,
        };

        // Replay everything known to be committed
        core.commit_index = hard_state.commit.min(core.last_log_index()).max(snapshot_last_index);
        core.apply_committed_entries();

        info!(
            node_id = id,
            term = core.current_term,
            commit = core.commit_index,
            last_index = core.last_log_index(),
            snapshot_index = snapshot_last_index,
            "raft core restored"
        );
        Ok(core)
    }

    /// Write the founding configuration of a new cluster.
    ///
    /// Every listed member is added by its own entry at term 1, already
    /// committed. No-op if this node has any log or snapshot.
    pub fn bootstrap(&mut self, members: &[PeerInfo]) -> bool {
        if self.last_log_index() > 0 || members.is_empty() {
            return false;
        }

        let entries: Vec<LogEntry> = members
            .iter()
            .enumerate()
            .map(|(i, info)| LogEntry {
                term: 1,
                index: i as u64 + 1,
                payload: EntryPayload::ConfChange(ConfChange::AddNode {
                    info: info.clone(),
                    role: PeerRole::Voter,
                }),
            })
            .collect();

        self.persist_entries(entries);
        self.current_term = self.current_term.max(1);
        self.commit_index = self.last_log_index();
        self.persist_hard_state();
        self.apply_committed_entries();
        info!(node_id = self.id, members = members.len(), "bootstrapped new cluster");
        true
    }

    /// Set the snapshot threshold (number of applied entries before auto-snapshot)
    /// Set to 0 to disable automatic snapshots
    pub fn set_snapshot_threshold(&mut self, threshold: u64) {
        self.snapshot_threshold = threshold;
    }

    /// Receiver that observes `last_applied`
    pub fn subscribe_applied(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Index of the entry that produced the current membership
    pub fn membership_index(&self) -> u64 {
        self.membership_index
    }

    /// True if this node may start elections
    pub fn can_campaign(&self) -> bool {
        self.membership.is_voter(self.id)
    }

    /// Every other member, voters and learners
    pub fn peers(&self) -> Vec<u64> {
        self.membership.ids().into_iter().filter(|&p| p != self.id).collect()
    }

    /// Voting members other than this node
    pub fn voting_peers(&self) -> Vec<u64> {
        self.membership.voters().into_iter().filter(|&p| p != self.id).collect()
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            leader: self.current_leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
            snapshot_index: self.snapshot_last_index,
            membership: self.membership.clone(),
        }
    }

    /// Error telling a caller where the leader is, if known
    pub fn not_leader(&self) -> RaftError {
        let leader_hint = self.current_leader.filter(|&l| l != self.id);
        RaftError::NotLeader {
            leader_hint,
            leader_addr: leader_hint.and_then(|l| self.membership.addr(l)).map(String::from),
        }
    }

    // === Persistence helpers ===

    fn halt(&self, what: &str, err: StorageError) -> ! {
        error!(node_id = self.id, error = %err, "failed to persist {}, halting", what);
        panic!("node {}: failed to persist {}: {}", self.id, what, err);
    }

    fn persist_hard_state(&mut self) {
        let state = HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit: self.commit_index,
        };
        if let Err(e) = self.storage.save_hard_state(&state) {
            self.halt("hard state", e);
        }
    }

    /// Adopt a newer term and forget the vote
    fn update_term(&mut self, new_term: u64) {
        self.current_term = new_term;
        self.voted_for = None;
        self.persist_hard_state();
    }

    fn persist_entries(&mut self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        if let Err(e) = self.storage.append_log_entries(&entries) {
            self.halt("log entries", e);
        }
        self.log.extend(entries);
    }

    /// Drop uncommitted entries from `from_index` on; their proposers get `ProposalDropped`
    fn truncate_from(&mut self, from_index: u64) {
        if let Err(e) = self.storage.truncate_log(from_index) {
            self.halt("log truncation", e);
        }
        self.log.retain(|e| e.index < from_index);
        if self.pending_conf_index.is_some_and(|i| i >= from_index) {
            self.pending_conf_index = None;
        }
        self.fail_pending_where(|index| index >= from_index, RaftError::ProposalDropped);
        debug!(node_id = self.id, from_index, "truncated conflicting log suffix");
    }

    fn fail_pending_where(&mut self, pred: impl Fn(u64) -> bool, err: RaftError) {
        let doomed: Vec<u64> = self.pending.keys().copied().filter(|&i| pred(i)).collect();
        for index in doomed {
            if let Some(p) = self.pending.remove(&index) {
                let _ = p.reply.send(Err(err.clone()));
            }
        }
    }

    /// Fail every outstanding proposal, e.g. on shutdown
    pub fn fail_pending(&mut self, err: RaftError) {
        self.fail_pending_where(|_| true, err);
    }

    // === Log accessors ===

    /// Get the last log index (returns snapshot_last_index if log is empty)
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map_or(self.snapshot_last_index, |e| e.index)
    }

    /// Get the term of the last log entry (returns snapshot_last_term if log is empty)
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(self.snapshot_last_term, |e| e.term)
    }

    /// Get a log entry by its index, accounting for snapshot offset
    /// Returns None if the entry is in the snapshot or beyond the log
    pub fn get_log_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset)
    }

    /// Term of the entry at `index`, including the snapshot boundary
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            Some(0)
        } else if index == self.snapshot_last_index {
            Some(self.snapshot_last_term)
        } else {
            self.get_log_entry(index).map(|e| e.term)
        }
    }

    /// Check if candidate's log is at least as up-to-date as receiver's log
    pub fn is_log_up_to_date(&self, candidate_last_log_term: u64, candidate_last_log_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        candidate_last_log_term > my_last_term
            || (candidate_last_log_term == my_last_term && candidate_last_log_index >= my_last_index)
    }

    /// Become follower, adopting `term` if it is newer
    fn step_down(&mut self, term: u64, reason: &'static str) {
        if term > self.current_term {
            self.update_term(term);
            self.current_leader = None;
        }
        if self.state != RaftState::Follower {
            info!(node_id = self.id, term = self.current_term, was = ?self.state, reason, "stepped down to follower");
        }
        self.state = RaftState::Follower;
        self.votes_received.clear();
        self.pending_conf_index = None;
        if let Some(t) = self.transfer.take() {
            debug!(node_id = self.id, target = t.target, "leadership transfer ended by step-down");
        }
    }

    // === RPC handlers ===

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&mut self, vote_req: &RequestVoteArgs) -> RequestVoteResult {
        // Decline requests with stale term immediately
        if vote_req.term < self.current_term {
            return RequestVoteResult { term: self.current_term, vote_granted: false };
        }

        if vote_req.term > self.current_term {
            self.step_down(vote_req.term, "higher term in vote request");
        }

        // If already voted for another candidate, decline vote
        if self.voted_for.is_some() && self.voted_for != Some(vote_req.candidate_id) {
            return RequestVoteResult { term: self.current_term, vote_granted: false };
        }

        if !self.is_log_up_to_date(vote_req.last_log_term, vote_req.last_log_index) {
            return RequestVoteResult { term: self.current_term, vote_granted: false };
        }

        self.voted_for = Some(vote_req.candidate_id);
        self.persist_hard_state();
        self.last_heartbeat = Instant::now();
        debug!(node_id = self.id, term = self.current_term, candidate = vote_req.candidate_id, "granted vote");

        RequestVoteResult { term: self.current_term, vote_granted: true }
    }

    /// Handle AppendEntries RPC (heartbeat or log replication)
    pub fn handle_append_entries(&mut self, append_req: &AppendEntriesArgs) -> HandleAppendEntriesOutput {
        if append_req.term > self.current_term {
            self.step_down(append_req.term, "higher term in append entries");
        }

        if append_req.term < self.current_term {
            return HandleAppendEntriesOutput {
                result: AppendEntriesResult {
                    term: self.current_term,
                    success: false,
                    match_index: self.last_log_index(),
                },
                leader_id: None,
            };
        }

        // Valid AppendEntries from current leader - reset election timeout
        if self.state != RaftState::Follower {
            self.step_down(append_req.term, "append entries from current leader");
        }
        self.current_leader = Some(append_req.leader_id);
        self.last_heartbeat = Instant::now();

        let prev = append_req.prev_log_index;
        let mismatch_hint = if prev < self.snapshot_last_index {
            // Everything up to the snapshot is committed and therefore matches
            None
        } else if prev > self.last_log_index() {
            Some(self.last_log_index())
        } else {
            match self.term_at(prev) {
                Some(term) if term == append_req.prev_log_term => None,
                Some(term) => Some(self.first_index_of_term(term, prev).saturating_sub(1)),
                None => Some(self.snapshot_last_index),
            }
        };

        if let Some(hint) = mismatch_hint {
            return HandleAppendEntriesOutput {
                result: AppendEntriesResult {
                    term: self.current_term,
                    success: false,
                    match_index: hint.max(self.commit_index),
                },
                leader_id: Some(append_req.leader_id),
            };
        }

        self.append_from_leader(&append_req.entries);

        let last_new = (prev + append_req.entries.len() as u64).max(self.snapshot_last_index);
        let new_commit = append_req.leader_commit.min(last_new);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.persist_hard_state();
            self.apply_committed_entries();
        }

        HandleAppendEntriesOutput {
            result: AppendEntriesResult {
                term: self.current_term,
                success: true,
                match_index: last_new,
            },
            leader_id: Some(append_req.leader_id),
        }
    }

    /// First index of the run of `term` entries ending at `index`
    fn first_index_of_term(&self, term: u64, index: u64) -> u64 {
        let mut first = index;
        while first > self.snapshot_last_index + 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Store entries sent by the leader, replacing any conflicting suffix
    fn append_from_leader(&mut self, entries: &[LogEntry]) {
        let mut to_append = Vec::new();
        for entry in entries {
            if entry.index <= self.snapshot_last_index {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry.clone());
                continue;
            }
            match self.get_log_entry(entry.index).map(|e| e.term) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    self.truncate_from(entry.index);
                    to_append.push(entry.clone());
                }
                None => to_append.push(entry.clone()),
            }
        }
        if let (Some(first), Some(last)) = (to_append.first(), to_append.last()) {
            debug!(node_id = self.id, first = first.index, last = last.index, "replicated entries");
        }
        self.persist_entries(to_append);
    }

    /// Handle InstallSnapshot RPC
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> InstallSnapshotResult {
        if args.term < self.current_term {
            return InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: "stale term".to_string(),
            };
        }

        if args.term > self.current_term || self.state != RaftState::Follower {
            self.step_down(args.term, "install snapshot from leader");
        }

        // Reset election timeout - we heard from valid leader
        self.last_heartbeat = Instant::now();
        self.current_leader = Some(args.leader_id);

        let snapshot = Snapshot::new(
            args.last_included_index,
            args.last_included_term,
            args.membership.clone(),
            args.data.clone(),
        );

        match self.install_snapshot(snapshot) {
            Ok(_) => InstallSnapshotResult::Success { term: self.current_term },
            Err(e) => InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: format!("failed to save snapshot: {}", e),
            },
        }
    }

    /// Replace local state with `snapshot` if it is ahead of what is committed here.
    /// Returns false if the snapshot was already covered.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool, StorageError> {
        let index = snapshot.metadata.last_included_index;
        let term = snapshot.metadata.last_included_term;
        if index <= self.commit_index {
            return Ok(false);
        }

        // Save first so disk never lags the state machine
        self.storage.save_snapshot(&snapshot)?;

        if let Err(e) = self.state_machine.restore(&snapshot.data, index) {
            error!(node_id = self.id, index, error = %e, "snapshot restore failed, halting");
            panic!("node {}: snapshot {} saved but cannot be restored: {}", self.id, index, e);
        }

        let keep_suffix = self.term_at(index) == Some(term);
        let compacted = if keep_suffix {
            self.storage.compact_log(index + 1)
        } else {
            self.storage
                .compact_log(index + 1)
                .and_then(|_| self.storage.truncate_log(index + 1))
        };
        if let Err(e) = compacted {
            self.halt("log compaction", e);
        }
        if keep_suffix {
            self.log.retain(|e| e.index > index);
        } else {
            self.log.clear();
            self.pending_conf_index = None;
        }

        self.snapshot_last_index = index;
        self.snapshot_last_term = term;
        self.membership = snapshot.metadata.membership;
        self.membership_index = index;
        self.commit_index = index;
        self.last_applied = index;
        self.persist_hard_state();

        // Outcome of proposals the snapshot swallowed is unknown here
        self.fail_pending_where(|i| i <= index, RaftError::ProposalDropped);
        self.applied_tx.send_replace(self.last_applied);

        info!(node_id = self.id, index, term, voters = ?self.membership.voters(), "installed snapshot");
        Ok(true)
    }

    /// Handle TimeoutNow RPC. The caller starts the election when accepted.
    pub fn handle_timeout_now(&mut self, args: &TimeoutNowArgs) -> TimeoutNowResult {
        let accepted = args.term == self.current_term
            && self.state == RaftState::Follower
            && self.can_campaign();
        if accepted {
            info!(node_id = self.id, term = self.current_term, from = args.leader_id, "leadership handed off to this node");
        }
        TimeoutNowResult { term: self.current_term, accepted }
    }

    // === Elections ===

    /// Start a new election (called when election timeout elapses).
    /// Returns true if this node won outright, i.e. it is the only voter.
    pub fn start_election(&mut self) -> bool {
        if !self.can_campaign() {
            return false;
        }

        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_hard_state();

        self.state = RaftState::Candidate;
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.last_heartbeat = Instant::now();
        info!(node_id = self.id, term = self.current_term, "became candidate");

        if self.has_vote_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    fn has_vote_quorum(&self) -> bool {
        let granted = self
            .votes_received
            .iter()
            .filter(|&&id| self.membership.is_voter(id))
            .count();
        granted >= self.membership.quorum()
    }

    /// Become leader (called after receiving majority of votes)
    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        self.last_heartbeat = Instant::now();
        self.transfer = None;
        info!(node_id = self.id, term = self.current_term, "became leader");

        // next_index points at the no-op so the first heartbeat carries it
        let last_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for peer_id in self.peers() {
            self.next_index.insert(peer_id, last_index + 1);
            self.match_index.insert(peer_id, 0);
        }

        // A leader may only count replicas of entries from its own term
        let noop = LogEntry::noop(self.current_term, last_index + 1);
        self.term_start_index = noop.index;
        self.persist_entries(vec![noop]);

        self.pending_conf_index = self
            .log
            .iter()
            .filter(|e| e.index > self.commit_index && e.is_conf_change())
            .map(|e| e.index)
            .last();

        self.maybe_advance_commit();
    }

    /// Handle a RequestVote result (called by candidate after receiving vote response)
    /// Returns true if this node became leader as a result
    pub fn handle_request_vote_result(&mut self, peer_id: u64, result: &RequestVoteResult) -> bool {
        if result.term > self.current_term {
            self.step_down(result.term, "higher term in vote response");
            return false;
        }

        if self.state != RaftState::Candidate || result.term != self.current_term || !result.vote_granted {
            return false;
        }

        self.votes_received.insert(peer_id);
        if self.has_vote_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // === Proposals ===

    /// Append an entry to the leader's log without waiting for its outcome
    pub fn append_log_entry(&mut self, payload: EntryPayload) -> Result<LogEntry, RaftError> {
        if self.state != RaftState::Leader {
            return Err(self.not_leader());
        }
        if self.transfer.is_some() {
            return Err(RaftError::TransferInProgress);
        }
        if let EntryPayload::ConfChange(change) = &payload {
            if self.pending_conf_index.is_some() {
                return Err(RaftError::MembershipConflict(
                    "another membership change is in progress".to_string(),
                ));
            }
            self.membership.validate(change).map_err(RaftError::MembershipConflict)?;
        }

        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            payload,
        };
        if entry.is_conf_change() {
            self.pending_conf_index = Some(entry.index);
        }
        debug!(node_id = self.id, index = entry.index, term = entry.term, "appended entry");
        self.persist_entries(vec![entry.clone()]);
        Ok(entry)
    }

    /// Append an entry and register `reply` to receive its outcome once applied.
    /// Errors are sent on `reply` immediately.
    pub fn propose(&mut self, payload: EntryPayload, reply: ProposalReply) -> Option<u64> {
        match self.append_log_entry(payload) {
            Ok(entry) => {
                self.pending.insert(entry.index, PendingProposal { term: entry.term, reply });
                self.maybe_advance_commit();
                Some(entry.index)
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                None
            }
        }
    }

    /// Index a linearizable read must wait for: the commit index, or this
    /// leader's no-op if that has not committed yet
    pub fn read_index(&self) -> u64 {
        self.commit_index.max(self.term_start_index)
    }

    // === Leadership transfer ===

    /// Stop accepting proposals and hand leadership to `target`, or to the
    /// most caught-up voter when `None`
    pub fn begin_transfer(&mut self, target: Option<u64>, timeout: Duration) -> Result<u64, RaftError> {
        if self.state != RaftState::Leader {
            return Err(self.not_leader());
        }
        if self.transfer.is_some() {
            return Err(RaftError::TransferInProgress);
        }

        let target = match target {
            Some(t) if t == self.id => {
                return Err(RaftError::MembershipConflict("node is already the leader".to_string()))
            }
            Some(t) if !self.membership.is_voter(t) => {
                return Err(RaftError::MembershipConflict(format!("node {} is not a voter", t)))
            }
            Some(t) => t,
            None => self
                .voting_peers()
                .into_iter()
                .max_by_key(|p| self.match_index.get(p).copied().unwrap_or(0))
                .ok_or_else(|| RaftError::MembershipConflict("no other voter to transfer to".to_string()))?,
        };

        self.transfer = Some(LeaderTransfer {
            target,
            deadline: Instant::now() + timeout,
            timeout_sent: false,
        });
        info!(node_id = self.id, term = self.current_term, target, "leadership transfer started");
        Ok(target)
    }

    /// Target and deadline of the transfer in progress
    pub fn transfer(&self) -> Option<(u64, Instant)> {
        self.transfer.as_ref().map(|t| (t.target, t.deadline))
    }

    /// The transfer target, once it holds every entry and has not yet been told to campaign
    pub fn transfer_ready(&self) -> Option<u64> {
        let t = self.transfer.as_ref()?;
        let matched = self.match_index.get(&t.target).copied().unwrap_or(0);
        (!t.timeout_sent && matched >= self.last_log_index()).then_some(t.target)
    }

    pub fn set_timeout_sent(&mut self, sent: bool) {
        if let Some(t) = self.transfer.as_mut() {
            t.timeout_sent = sent;
        }
    }

    pub fn abort_transfer(&mut self) -> Option<u64> {
        let t = self.transfer.take()?;
        warn!(node_id = self.id, target = t.target, "leadership transfer aborted");
        Some(t.target)
    }

    // === Replication ===

    /// Build the next message for `peer`: entries from its next index, or the
    /// snapshot when those entries were compacted away
    pub fn replication_request(&self, peer_id: u64, max_entries: usize) -> Option<ReplicationRequest> {
        if self.state != RaftState::Leader {
            return None;
        }

        let next_idx = self.next_index.get(&peer_id).copied().unwrap_or(1).max(1);
        if next_idx <= self.snapshot_last_index {
            return match self.storage.load_snapshot() {
                Ok(Some(snapshot)) => Some(ReplicationRequest::Snapshot(InstallSnapshotArgs {
                    term: self.current_term,
                    leader_id: self.id,
                    last_included_index: snapshot.metadata.last_included_index,
                    last_included_term: snapshot.metadata.last_included_term,
                    membership: snapshot.metadata.membership,
                    data: snapshot.data,
                })),
                Ok(None) => None,
                Err(e) => {
                    warn!(node_id = self.id, peer = peer_id, error = %e, "cannot load snapshot for peer");
                    None
                }
            };
        }

        let prev_log_index = next_idx - 1;
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);
        let start = (next_idx - self.snapshot_last_index - 1) as usize;
        let entries: Vec<LogEntry> = self.log.iter().skip(start).take(max_entries).cloned().collect();

        Some(ReplicationRequest::Append(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    /// Empty AppendEntries used to confirm leadership
    pub fn heartbeat_request(&self, peer_id: u64) -> AppendEntriesArgs {
        let next_idx = self.next_index.get(&peer_id).copied().unwrap_or(1).max(1);
        let prev_log_index = (next_idx - 1).max(self.snapshot_last_index).min(self.last_log_index());
        AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.term_at(prev_log_index).unwrap_or(0),
            entries: vec![],
            leader_commit: self.commit_index,
        }
    }

    /// Handle an AppendEntries result (called by leader after receiving replication response)
    /// Returns true if the commit index advanced
    pub fn handle_append_entries_result(&mut self, peer_id: u64, result: &AppendEntriesResult) -> bool {
        if result.term > self.current_term {
            self.step_down(result.term, "higher term in append response");
            return false;
        }
        if self.state != RaftState::Leader || result.term < self.current_term {
            return false;
        }
        if !self.membership.contains(peer_id) {
            return false;
        }

        let current_match = self.match_index.get(&peer_id).copied().unwrap_or(0);
        if result.success {
            let matched = current_match.max(result.match_index);
            self.match_index.insert(peer_id, matched);
            let next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            self.next_index.insert(peer_id, next.max(matched + 1));
            self.maybe_advance_commit()
        } else {
            // Jump straight to the follower's hint instead of stepping back one entry at a time
            let next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            let retry_from = next
                .saturating_sub(1)
                .min(result.match_index + 1)
                .max(current_match + 1)
                .max(1);
            self.next_index.insert(peer_id, retry_from);
            false
        }
    }

    /// Handle an InstallSnapshot result from `peer_id` for a snapshot ending at `last_included_index`
    pub fn handle_install_snapshot_result(
        &mut self,
        peer_id: u64,
        last_included_index: u64,
        result: &InstallSnapshotResult,
    ) -> bool {
        match result {
            InstallSnapshotResult::Success { term } => {
                if *term > self.current_term {
                    self.step_down(*term, "higher term in snapshot response");
                    return false;
                }
                if self.state != RaftState::Leader {
                    return false;
                }
                let matched = self.match_index.get(&peer_id).copied().unwrap_or(0).max(last_included_index);
                self.match_index.insert(peer_id, matched);
                self.next_index.insert(peer_id, matched + 1);
                debug!(node_id = self.id, peer = peer_id, index = last_included_index, "peer installed snapshot");
                self.maybe_advance_commit()
            }
            InstallSnapshotResult::Failed { term, reason } => {
                if *term > self.current_term {
                    self.step_down(*term, "higher term in snapshot response");
                } else {
                    warn!(node_id = self.id, peer = peer_id, reason = %reason, "peer rejected snapshot");
                }
                false
            }
        }
    }

    /// Advance the commit index to the highest entry of the current term
    /// stored on a quorum of voters. Returns true if it moved.
    pub fn maybe_advance_commit(&mut self) -> bool {
        if self.state != RaftState::Leader {
            return false;
        }

        let mut matched: Vec<u64> = self
            .membership
            .voters()
            .into_iter()
            .map(|v| {
                if v == self.id {
                    self.last_log_index()
                } else {
                    self.match_index.get(&v).copied().unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return false;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.membership.quorum() - 1];
        if candidate <= self.commit_index || self.term_at(candidate) != Some(self.current_term) {
            return false;
        }

        self.commit_index = candidate;
        self.persist_hard_state();
        debug!(node_id = self.id, term = self.current_term, commit = candidate, "commit index advanced");
        self.apply_committed_entries();
        true
    }

    // === Applying ===

    /// Apply committed entries to the state machine and answer their proposers.
    /// Returns the number of entries applied.
    pub fn apply_committed_entries(&mut self) -> usize {
        let mut applied = 0;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.get_log_entry(index).cloned() else {
                error!(node_id = self.id, index, "committed entry missing from log, halting");
                panic!("node {}: committed entry {} missing from log", self.id, index);
            };

            let result: ApplyResult = match &entry.payload {
                EntryPayload::Noop => Ok(()),
                EntryPayload::Proposal(actions) => self.state_machine.apply(index, actions),
                EntryPayload::ConfChange(change) => {
                    self.apply_conf_change(index, change);
                    Ok(())
                }
            };
            self.last_applied = index;
            applied += 1;

            if let Some(p) = self.pending.remove(&index) {
                let outcome = if p.term == entry.term {
                    Ok(result)
                } else {
                    Err(RaftError::ProposalDropped)
                };
                let _ = p.reply.send(outcome);
            }
        }

        if applied == 0 {
            return 0;
        }
        self.applied_tx.send_replace(self.last_applied);

        // Every node compacts independently; leaders also ship snapshots to laggards
        if self.snapshot_threshold > 0 {
            let since_snapshot = self.last_applied - self.snapshot_last_index;
            if since_snapshot >= self.snapshot_threshold {
                debug!(node_id = self.id, since_snapshot, "automatic snapshot triggered");
                if let Err(e) = self.take_snapshot() {
                    self.halt("snapshot", e);
                }
            }
        }
        applied
    }

    fn apply_conf_change(&mut self, index: u64, change: &ConfChange) {
        if self.pending_conf_index.is_some_and(|i| i <= index) {
            self.pending_conf_index = None;
        }
        if !self.membership.apply(change) {
            warn!(node_id = self.id, index, ?change, "ignored invalid membership change");
            return;
        }
        self.membership_index = index;
        info!(node_id = self.id, index, ?change, voters = ?self.membership.voters(), "membership change applied");

        match change {
            ConfChange::AddNode { info, .. } if info.id != self.id && self.state == RaftState::Leader => {
                self.next_index.insert(info.id, self.last_log_index() + 1);
                self.match_index.insert(info.id, 0);
            }
            ConfChange::RemoveNode { id } if *id == self.id => {
                if self.state == RaftState::Leader {
                    self.step_down(self.current_term, "removed from cluster");
                }
                self.state = RaftState::Follower;
                self.current_leader = None;
            }
            ConfChange::RemoveNode { id } => {
                self.next_index.remove(id);
                self.match_index.remove(id);
            }
            _ => {}
        }
    }

    // === Snapshots ===

    /// Take a snapshot of the state machine up to last_applied and discard
    /// the log entries it covers. Returns None if there is nothing new.
    pub fn take_snapshot(&mut self) -> Result<Option<SnapshotMetadata>, StorageError> {
        if self.last_applied <= self.snapshot_last_index {
            return Ok(None);
        }

        let last_applied_term = self
            .term_at(self.last_applied)
            .ok_or_else(|| StorageError::Corruption(format!("entry {} missing from log", self.last_applied)))?;
        let data = self
            .state_machine
            .snapshot()
            .map_err(|e| StorageError::Codec(e.to_string()))?;

        let snapshot = Snapshot::new(self.last_applied, last_applied_term, self.membership.clone(), data);
        self.storage.save_snapshot(&snapshot)?;

        // The in-memory log and its offset move together, only once the
        // persisted log agrees with them
        let keep_from = snapshot.index() + 1;
        self.storage.compact_log(keep_from)?;
        self.log.retain(|entry| entry.index >= keep_from);
        self.snapshot_last_index = snapshot.index();
        self.snapshot_last_term = snapshot.term();

        info!(
            node_id = self.id,
            index = self.snapshot_last_index,
            term = self.snapshot_last_term,
            "snapshot taken"
        );
        Ok(Some(snapshot.metadata))
    }

    /// Load the current snapshot from storage
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.storage.load_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::store::{MemoryStore, Object, ObjectKind, StoreError, Task};

    fn voters(ids: &[u64]) -> Membership {
        let mut membership = Membership::new();
        for &id in ids {
            membership.apply(&ConfChange::AddNode {
                info: PeerInfo::new(id, format!("mem://{}", id)),
                role: PeerRole::Voter,
            });
        }
        membership
    }

    /// Core with a fixed voter set and an empty log
    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        new_test_core_with_store(id, peers, MemoryStore::new())
    }

    fn new_test_core_with_store(id: u64, peers: Vec<u64>, store: MemoryStore) -> RaftCore {
        let mut core = RaftCore::new(id, Box::new(MemoryStorage::new()), Box::new(store)).unwrap();
        let mut ids = vec![id];
        ids.extend(peers);
        core.membership = voters(&ids);
        core
    }

    fn create_task(term: u64, index: u64, task_id: &str) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: EntryPayload::Proposal(vec![StoreAction::Create(Object::Task(Task::new(
                task_id, "svc",
            )))]),
        }
    }

    fn ok(term: u64, match_index: u64) -> AppendEntriesResult {
        AppendEntriesResult { term, success: true, match_index }
    }

    fn make_leader(core: &mut RaftCore) {
        core.start_election();
        let peers = core.voting_peers();
        for peer in peers {
            if core.state == RaftState::Leader {
                break;
            }
            core.handle_request_vote_result(peer, &RequestVoteResult { term: core.current_term, vote_granted: true });
        }
        assert_eq!(core.state, RaftState::Leader);
    }

    #[test]
    fn test_new_node() {
        let node = new_test_core(1, vec![2, 3]);
        assert_eq!(node.id, 1);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.state, RaftState::Follower);
        assert!(node.log.is_empty());
    }

    #[test]
    fn test_election() {
        let mut node = new_test_core(1, vec![2, 3]);
        assert!(!node.start_election());
        assert_eq!(node.state, RaftState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
    }

    #[test]
    fn test_single_node_cluster_immediate_leader() {
        let mut node = new_test_core(1, vec![]);
        assert!(node.start_election());
        assert_eq!(node.state, RaftState::Leader);
        // The no-op commits without any peer
        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn test_non_member_never_campaigns() {
        let mut node = RaftCore::new(4, Box::new(MemoryStorage::new()), Box::new(MemoryStore::new())).unwrap();
        assert!(!node.can_campaign());
        assert!(!node.start_election());
        assert_eq!(node.current_term, 0);
        assert_eq!(node.state, RaftState::Follower);
    }

    #[test]
    fn test_learner_never_campaigns() {
        let mut node = new_test_core(1, vec![2]);
        node.membership.apply(&ConfChange::AddNode { info: PeerInfo::new(3, "mem://3"), role: PeerRole::Learner });
        node.id = 3;
        assert!(!node.start_election());
    }

    #[test]
    fn test_request_vote() {
        let mut node = new_test_core(1, vec![2, 3]);
        let args = RequestVoteArgs { term: 1, candidate_id: 2, last_log_index: 0, last_log_term: 0 };
        let result = node.handle_request_vote(&args);
        assert!(result.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn test_vote_denied_candidate_has_lower_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 5;

        let args = RequestVoteArgs { term: 3, candidate_id: 2, last_log_index: 0, last_log_term: 0 };
        let result = node.handle_request_vote(&args);

        assert!(!result.vote_granted);
        assert_eq!(result.term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn test_vote_denied_already_voted_for_another() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(2);

        let args = RequestVoteArgs { term: 1, candidate_id: 3, last_log_index: 0, last_log_term: 0 };
        assert!(!node.handle_request_vote(&args).vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn test_vote_granted_to_same_candidate_again() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(2);

        let args = RequestVoteArgs { term: 1, candidate_id: 2, last_log_index: 0, last_log_term: 0 };
        assert!(node.handle_request_vote(&args).vote_granted);
    }

    #[test]
    fn test_vote_denied_candidate_log_has_older_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(3, 1, "t1"));

        let args = RequestVoteArgs { term: 4, candidate_id: 2, last_log_index: 1, last_log_term: 2 };
        let result = node.handle_request_vote(&args);

        assert!(!result.vote_granted);
        assert_eq!(node.current_term, 4);
    }

    #[test]
    fn test_vote_denied_candidate_log_is_shorter() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(2, 1, "t1"));
        node.log.push(create_task(2, 2, "t2"));

        let args = RequestVoteArgs { term: 3, candidate_id: 2, last_log_index: 1, last_log_term: 2 };
        assert!(!node.handle_request_vote(&args).vote_granted);
    }

    #[test]
    fn test_vote_granted_candidate_log_has_higher_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(2, 1, "t1"));

        let args = RequestVoteArgs { term: 4, candidate_id: 2, last_log_index: 1, last_log_term: 3 };
        assert!(node.handle_request_vote(&args).vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn test_leader_steps_down_on_higher_term_in_vote_response() {
        let mut node = new_test_core(1, vec![2, 3]);
        make_leader(&mut node);

        node.handle_request_vote_result(2, &RequestVoteResult { term: 5, vote_granted: false });

        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn test_candidate_steps_down_on_append_entries_from_new_leader() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election();

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_leader, Some(2));
    }

    #[test]
    fn test_append_entries_stale_term_no_reset() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 2;
        let before = node.last_heartbeat;

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(!output.result.success);
        assert_eq!(output.leader_id, None);
        assert_eq!(node.last_heartbeat, before);
    }

    #[test]
    fn test_election_needs_majority_in_5_node_cluster() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election();
        let term = node.current_term;

        assert!(!node.handle_request_vote_result(2, &RequestVoteResult { term, vote_granted: true }));
        assert_eq!(node.state, RaftState::Candidate);
        assert!(node.handle_request_vote_result(3, &RequestVoteResult { term, vote_granted: true }));
        assert_eq!(node.state, RaftState::Leader);
    }

    #[test]
    fn test_votes_from_learners_do_not_count() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.membership.apply(&ConfChange::AddNode { info: PeerInfo::new(4, "mem://4"), role: PeerRole::Learner });
        node.start_election();
        let term = node.current_term;

        assert!(!node.handle_request_vote_result(4, &RequestVoteResult { term, vote_granted: true }));
        assert_eq!(node.state, RaftState::Candidate);
    }

    #[test]
    fn test_ignore_stale_vote_response_from_old_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election();
        node.start_election();

        assert!(!node.handle_request_vote_result(2, &RequestVoteResult { term: 1, vote_granted: true }));
        assert_eq!(node.state, RaftState::Candidate);
    }

    #[test]
    fn test_append_entries_fails_prev_log_index_too_high() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(1, 1, "t1"));

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 5,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(!output.result.success);
        // Hint points the leader at our last entry
        assert_eq!(output.result.match_index, 1);
    }

    #[test]
    fn test_append_entries_conflict_hint_skips_whole_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(1, 1, "t1"));
        node.log.push(create_task(2, 2, "t2"));
        node.log.push(create_task(2, 3, "t3"));
        node.log.push(create_task(2, 4, "t4"));

        let args = AppendEntriesArgs {
            term: 3,
            leader_id: 2,
            prev_log_index: 4,
            prev_log_term: 3,
            entries: vec![],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(!output.result.success);
        assert_eq!(output.result.match_index, 1);
    }

    #[test]
    fn test_append_entries_truncates_conflicting_entries() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(1, 1, "t1"));
        node.log.push(create_task(1, 2, "stale"));
        node.log.push(create_task(1, 3, "stale2"));

        let args = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![create_task(2, 2, "fresh")],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(output.result.match_index, 2);
        assert_eq!(node.log.len(), 2);
        assert_eq!(node.log[1], create_task(2, 2, "fresh"));
    }

    #[test]
    fn test_append_entries_idempotent() {
        let mut node = new_test_core(1, vec![2, 3]);
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![create_task(1, 1, "t1"), create_task(1, 2, "t2")],
            leader_commit: 0,
        };
        node.handle_append_entries(&args);
        node.handle_append_entries(&args);
        assert_eq!(node.log.len(), 2);
    }

    #[test]
    fn test_follower_commit_limited_to_last_new_entry() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(1, 1, "t1"));
        node.log.push(create_task(1, 2, "t2"));
        node.log.push(create_task(1, 3, "t3"));

        // Heartbeat verifies only up to index 1
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 3,
        };
        node.handle_append_entries(&args);

        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
    }

    #[test]
    fn test_commit_applies_to_store() {
        let store = MemoryStore::new();
        let mut node = new_test_core_with_store(1, vec![2, 3], store.clone());

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![create_task(1, 1, "t1"), create_task(1, 2, "t2")],
            leader_commit: 2,
        };
        node.handle_append_entries(&args);

        assert_eq!(node.last_applied, 2);
        assert_eq!(store.get(ObjectKind::Task, "t2").unwrap().version(), 2);
        assert_eq!(*node.subscribe_applied().borrow(), 2);
    }

    #[test]
    fn test_become_leader_initializes_replication_state() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(create_task(1, 1, "t1"));
        node.current_term = 1;
        make_leader(&mut node);

        // No-op appended at index 2, peers start probing at it
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.log[1].payload, EntryPayload::Noop);
        assert_eq!(node.next_index.get(&2), Some(&2));
        assert_eq!(node.match_index.get(&3), Some(&0));
    }

    #[test]
    fn test_leader_cannot_commit_previous_term_entries_directly() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.log.push(create_task(1, 1, "t1"));
        leader.current_term = 1;
        make_leader(&mut leader);

        // Peer 2 has only the term-1 entry
        let committed = leader.handle_append_entries_result(2, &ok(leader.current_term, 1));

        assert!(!committed);
        assert_eq!(leader.commit_index, 0);
    }

    #[test]
    fn test_previous_term_entries_committed_indirectly() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.log.push(create_task(1, 1, "t1"));
        leader.current_term = 1;
        make_leader(&mut leader);

        // Peer 2 stores the no-op from the current term
        let committed = leader.handle_append_entries_result(2, &ok(leader.current_term, 2));

        assert!(committed);
        assert_eq!(leader.commit_index, 2);
        assert_eq!(leader.last_applied, 2);
    }

    #[test]
    fn test_failed_append_uses_hint() {
        let mut leader = new_test_core(1, vec![2, 3]);
        for i in 1..=10 {
            leader.log.push(create_task(1, i, &format!("t{}", i)));
        }
        leader.current_term = 1;
        make_leader(&mut leader);
        assert_eq!(leader.next_index.get(&2), Some(&11));

        let result = AppendEntriesResult { term: leader.current_term, success: false, match_index: 3 };
        leader.handle_append_entries_result(2, &result);
        assert_eq!(leader.next_index.get(&2), Some(&4));

        // A hint above the current attempt still moves back by one
        let result = AppendEntriesResult { term: leader.current_term, success: false, match_index: 9 };
        leader.handle_append_entries_result(2, &result);
        assert_eq!(leader.next_index.get(&2), Some(&3));
    }

    #[test]
    fn test_match_index_does_not_decrease() {
        let mut leader = new_test_core(1, vec![2, 3]);
        make_leader(&mut leader);
        leader.append_log_entry(EntryPayload::Noop).unwrap();

        leader.handle_append_entries_result(2, &ok(leader.current_term, 2));
        leader.handle_append_entries_result(2, &ok(leader.current_term, 1));

        assert_eq!(leader.match_index.get(&2), Some(&2));
    }

    #[test]
    fn test_non_leader_cannot_append_entries() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_leader = Some(2);
        let err = node.append_log_entry(EntryPayload::Noop).unwrap_err();
        assert_eq!(
            err,
            RaftError::NotLeader { leader_hint: Some(2), leader_addr: Some("mem://2".to_string()) }
        );
    }

    #[tokio::test]
    async fn test_proposal_reply_carries_store_result() {
        let store = MemoryStore::new();
        let mut leader = new_test_core_with_store(1, vec![], store.clone());
        make_leader(&mut leader);

        let create = EntryPayload::Proposal(vec![StoreAction::Create(Object::Task(Task::new("t1", "svc")))]);
        let (tx, rx) = oneshot::channel();
        leader.propose(create.clone(), tx);
        assert_eq!(rx.await.unwrap(), Ok(Ok(())));

        let (tx, rx) = oneshot::channel();
        leader.propose(create, tx);
        assert!(matches!(rx.await.unwrap(), Ok(Err(StoreError::Exists { .. }))));
    }

    #[tokio::test]
    async fn test_truncated_proposal_is_dropped() {
        let mut node = new_test_core(1, vec![2, 3]);
        make_leader(&mut node);
        let (tx, rx) = oneshot::channel();
        let index = node.propose(EntryPayload::Noop, tx).unwrap();

        // A new leader overwrites the uncommitted entry
        let args = AppendEntriesArgs {
            term: node.current_term + 1,
            leader_id: 2,
            prev_log_index: index - 1,
            prev_log_term: node.current_term,
            entries: vec![create_task(node.current_term + 1, index, "other")],
            leader_commit: 0,
        };
        node.handle_append_entries(&args);

        assert_eq!(rx.await.unwrap(), Err(RaftError::ProposalDropped));
    }

    #[test]
    fn test_only_one_membership_change_at_a_time() {
        let mut leader = new_test_core(1, vec![2, 3]);
        make_leader(&mut leader);

        let add = |id: u64| {
            EntryPayload::ConfChange(ConfChange::AddNode {
                info: PeerInfo::new(id, format!("mem://{}", id)),
                role: PeerRole::Voter,
            })
        };
        leader.append_log_entry(add(4)).unwrap();
        assert!(matches!(leader.append_log_entry(add(5)), Err(RaftError::MembershipConflict(_))));
    }

    #[test]
    fn test_removing_last_voter_rejected() {
        let mut leader = new_test_core(1, vec![]);
        make_leader(&mut leader);
        let err = leader
            .append_log_entry(EntryPayload::ConfChange(ConfChange::RemoveNode { id: 1 }))
            .unwrap_err();
        assert!(matches!(err, RaftError::MembershipConflict(_)));
    }

    #[test]
    fn test_membership_applies_on_commit() {
        let mut leader = new_test_core(1, vec![]);
        make_leader(&mut leader);

        let (tx, _rx) = oneshot::channel();
        leader.propose(
            EntryPayload::ConfChange(ConfChange::AddNode {
                info: PeerInfo::new(2, "mem://2"),
                role: PeerRole::Voter,
            }),
            tx,
        );

        // Single voter commits immediately; node 2 now needs replication
        assert!(leader.membership().is_voter(2));
        assert_eq!(leader.next_index.get(&2), Some(&(leader.last_log_index() + 1)));
        assert_eq!(leader.membership().quorum(), 2);
    }

    #[test]
    fn test_leader_steps_down_after_own_removal_commits() {
        let mut leader = new_test_core(1, vec![2, 3]);
        make_leader(&mut leader);
        let entry = leader
            .append_log_entry(EntryPayload::ConfChange(ConfChange::RemoveNode { id: 1 }))
            .unwrap();

        leader.handle_append_entries_result(2, &ok(leader.current_term, entry.index));

        assert_eq!(leader.state, RaftState::Follower);
        assert!(!leader.membership().contains(1));
        assert!(!leader.can_campaign());
    }

    #[test]
    fn test_transfer_blocks_proposals_until_ready() {
        let mut leader = new_test_core(1, vec![2, 3]);
        make_leader(&mut leader);

        assert_eq!(leader.begin_transfer(Some(2), Duration::from_secs(1)), Ok(2));
        assert_eq!(leader.append_log_entry(EntryPayload::Noop), Err(RaftError::TransferInProgress));
        assert_eq!(leader.transfer_ready(), None);

        let last = leader.last_log_index();
        leader.handle_append_entries_result(2, &ok(leader.current_term, last));
        assert_eq!(leader.transfer_ready(), Some(2));

        // Seeing the target's election ends the transfer
        leader.handle_request_vote(&RequestVoteArgs {
            term: leader.current_term + 1,
            candidate_id: 2,
            last_log_index: last,
            last_log_term: leader.current_term,
        });
        assert_eq!(leader.state, RaftState::Follower);
        assert!(leader.transfer().is_none());
    }

    #[test]
    fn test_transfer_target_must_be_voter() {
        let mut leader = new_test_core(1, vec![2]);
        make_leader(&mut leader);
        assert!(matches!(leader.begin_transfer(Some(9), Duration::from_secs(1)), Err(RaftError::MembershipConflict(_))));
        assert!(matches!(leader.begin_transfer(Some(1), Duration::from_secs(1)), Err(RaftError::MembershipConflict(_))));
    }

    #[test]
    fn test_timeout_now_accepted_only_for_current_term() {
        let mut node = new_test_core(2, vec![1, 3]);
        node.current_term = 3;
        assert!(node.handle_timeout_now(&TimeoutNowArgs { term: 3, leader_id: 1 }).accepted);
        assert!(!node.handle_timeout_now(&TimeoutNowArgs { term: 2, leader_id: 1 }).accepted);
    }

    #[test]
    fn test_read_index_waits_for_noop() {
        let mut leader = new_test_core(1, vec![2, 3]);
        make_leader(&mut leader);
        assert_eq!(leader.commit_index, 0);
        assert_eq!(leader.read_index(), 1);
    }

    #[test]
    fn test_bootstrap_commits_founding_members() {
        let store = MemoryStore::new();
        let mut node = RaftCore::new(1, Box::new(MemoryStorage::new()), Box::new(store)).unwrap();

        assert!(node.bootstrap(&[PeerInfo::new(1, "mem://1"), PeerInfo::new(2, "mem://2")]));
        assert_eq!(node.commit_index, 2);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.membership().voters(), vec![1, 2]);

        // A second bootstrap is ignored
        assert!(!node.bootstrap(&[PeerInfo::new(1, "mem://1")]));
    }

    #[test]
    fn test_node_restarts_with_full_state() {
        let mut storage = MemoryStorage::new();
        storage.save_hard_state(&HardState { term: 4, voted_for: Some(2), commit: 2 }).unwrap();
        storage
            .append_log_entries(&[create_task(3, 1, "t1"), create_task(4, 2, "t2"), create_task(4, 3, "t3")])
            .unwrap();

        let store = MemoryStore::new();
        let node = RaftCore::new(1, Box::new(storage), Box::new(store.clone())).unwrap();

        assert_eq!(node.current_term, 4);
        assert_eq!(node.voted_for, Some(2));
        assert_eq!(node.commit_index, 2);
        // Committed entries replayed, uncommitted one left alone
        assert!(store.get(ObjectKind::Task, "t2").is_some());
        assert!(store.get(ObjectKind::Task, "t3").is_none());
    }

    #[test]
    fn test_restart_rejects_log_gap() {
        let mut storage = MemoryStorage::new();
        storage.append_log_entries(&[create_task(1, 1, "t1"), create_task(1, 3, "t3")]).unwrap();
        let result = RaftCore::new(1, Box::new(storage), Box::new(MemoryStore::new()));
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_take_snapshot_compacts_log() {
        let store = MemoryStore::new();
        let mut node = new_test_core_with_store(1, vec![2, 3], store);
        node.current_term = 1;
        for i in 1..=4 {
            node.log.push(create_task(1, i, &format!("t{}", i)));
        }
        node.commit_index = 3;
        node.apply_committed_entries();

        let metadata = node.take_snapshot().unwrap().unwrap();

        assert_eq!(metadata.last_included_index, 3);
        assert_eq!(metadata.membership.voters(), vec![1, 2, 3]);
        assert_eq!(node.log.len(), 1);
        assert_eq!(node.last_log_index(), 4);
        assert_eq!(node.term_at(3), Some(1));
        assert!(node.take_snapshot().unwrap().is_none());
    }

    #[test]
    fn test_snapshot_restores_store_on_startup() {
        let mut storage = MemoryStorage::new();
        {
            let store = MemoryStore::new();
            store
                .apply_actions(1, &[StoreAction::Create(Object::Task(Task::new("t1", "svc")))])
                .unwrap();
            let data = crate::state_machine::Snapshotable::snapshot(&store).unwrap();
            storage
                .save_snapshot(&Snapshot {
                    metadata: SnapshotMetadata {
                        last_included_index: 5,
                        last_included_term: 2,
                        membership: voters(&[1, 2, 3]),
                    },
                    data,
                })
                .unwrap();
        }

        let store = MemoryStore::new();
        let node = RaftCore::new(1, Box::new(storage), Box::new(store.clone())).unwrap();

        assert_eq!(node.last_applied, 5);
        assert_eq!(node.last_log_index(), 5);
        assert_eq!(node.membership().voters(), vec![1, 2, 3]);
        assert_eq!(store.get(ObjectKind::Task, "t1").unwrap().version(), 1);
    }

    #[test]
    fn test_handle_install_snapshot_replaces_divergent_log() {
        let source = MemoryStore::new();
        source
            .apply_actions(7, &[StoreAction::Create(Object::Task(Task::new("snap", "svc")))])
            .unwrap();
        let data = crate::state_machine::Snapshotable::snapshot(&source).unwrap();

        let store = MemoryStore::new();
        let mut node = new_test_core_with_store(2, vec![1, 3], store.clone());
        node.log.push(create_task(1, 1, "old"));

        let args = InstallSnapshotArgs {
            term: 3,
            leader_id: 1,
            last_included_index: 10,
            last_included_term: 3,
            membership: voters(&[1, 2, 3, 4]),
            data,
        };
        let result = node.handle_install_snapshot(&args);

        assert!(matches!(result, InstallSnapshotResult::Success { term: 3 }));
        assert!(node.log.is_empty());
        assert_eq!(node.commit_index, 10);
        assert_eq!(node.last_applied, 10);
        assert_eq!(node.membership().voters(), vec![1, 2, 3, 4]);
        assert!(store.get(ObjectKind::Task, "snap").is_some());
        assert_eq!(node.current_leader, Some(1));

        // The same snapshot again is acknowledged without reinstalling
        assert!(matches!(node.handle_install_snapshot(&args), InstallSnapshotResult::Success { .. }));
    }

    #[test]
    fn test_handle_install_snapshot_stale_term() {
        let mut node = new_test_core(2, vec![1, 3]);
        node.current_term = 5;
        let args = InstallSnapshotArgs {
            term: 3,
            leader_id: 1,
            last_included_index: 10,
            last_included_term: 3,
            membership: voters(&[1, 2, 3]),
            data: vec![],
        };
        assert!(matches!(node.handle_install_snapshot(&args), InstallSnapshotResult::Failed { term: 5, .. }));
    }

    #[test]
    fn test_leader_sends_snapshot_to_lagging_peer() {
        let mut leader = new_test_core(1, vec![2, 3]);
        make_leader(&mut leader);
        for _ in 0..3 {
            leader.append_log_entry(EntryPayload::Noop).unwrap();
        }
        leader.commit_index = leader.last_log_index();
        leader.apply_committed_entries();
        leader.take_snapshot().unwrap();
        leader.next_index.insert(2, 1);

        match leader.replication_request(2, 16) {
            Some(ReplicationRequest::Snapshot(args)) => assert_eq!(args.last_included_index, 4),
            other => panic!("expected snapshot, got {:?}", other),
        }

        leader.handle_install_snapshot_result(2, 4, &InstallSnapshotResult::Success { term: leader.current_term });
        assert_eq!(leader.next_index.get(&2), Some(&5));
    }

    #[test]
    fn test_replication_request_respects_batch_limit() {
        let mut leader = new_test_core(1, vec![2]);
        make_leader(&mut leader);
        for _ in 0..9 {
            leader.append_log_entry(EntryPayload::Noop).unwrap();
        }
        leader.next_index.insert(2, 1);

        match leader.replication_request(2, 4) {
            Some(ReplicationRequest::Append(args)) => {
                assert_eq!(args.prev_log_index, 0);
                assert_eq!(args.entries.len(), 4);
            }
            other => panic!("expected append, got {:?}", other),
        }
    }

    #[test]
    fn test_automatic_snapshot_triggering() {
        let mut node = new_test_core(1, vec![]);
        node.set_snapshot_threshold(5);
        make_leader(&mut node);

        for _ in 0..3 {
            let (tx, _rx) = oneshot::channel();
            node.propose(EntryPayload::Noop, tx);
        }
        assert_eq!(node.snapshot_last_index, 0);

        let (tx, _rx) = oneshot::channel();
        node.propose(EntryPayload::Noop, tx);
        assert_eq!(node.snapshot_last_index, 5);
        assert!(node.log.is_empty());
    }

    #[test]
    fn test_automatic_snapshot_disabled_when_threshold_is_zero() {
        let mut node = new_test_core(1, vec![]);
        node.set_snapshot_threshold(0);
        make_leader(&mut node);
        for _ in 0..20 {
            let (tx, _rx) = oneshot::channel();
            node.propose(EntryPayload::Noop, tx);
        }
        assert_eq!(node.snapshot_last_index, 0);
        assert_eq!(node.log.len(), 21);
    }

    /// Memory storage whose log compaction always fails
    #[derive(Default)]
    struct FullDisk(MemoryStorage);

    impl Storage for FullDisk {
        fn load_hard_state(&self) -> Result<HardState, StorageError> {
            self.0.load_hard_state()
        }
        fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
            self.0.save_hard_state(state)
        }
        fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
            self.0.load_log()
        }
        fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
            self.0.append_log_entries(entries)
        }
        fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
            self.0.truncate_log(from_index)
        }
        fn compact_log(&mut self, _before_index: u64) -> Result<(), StorageError> {
            Err(StorageError::Io("disk full".into()))
        }
        fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
            self.0.load_snapshot()
        }
        fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
            self.0.save_snapshot(snapshot)
        }
    }

    fn new_core_on_full_disk(id: u64, peers: &[u64]) -> RaftCore {
        let mut core = RaftCore::new(id, Box::new(FullDisk::default()), Box::new(MemoryStore::new())).unwrap();
        let mut ids = vec![id];
        ids.extend_from_slice(peers);
        core.membership = voters(&ids);
        core
    }

    #[test]
    fn test_failed_compaction_leaves_log_offsets_intact() {
        let mut node = new_core_on_full_disk(1, &[2, 3]);
        node.current_term = 1;
        for i in 1..=4 {
            node.log.push(create_task(1, i, &format!("t{}", i)));
        }
        node.commit_index = 3;
        node.apply_committed_entries();

        let err = node.take_snapshot().unwrap_err();

        assert_eq!(err, StorageError::Io("disk full".into()));
        assert_eq!(node.snapshot_last_index, 0);
        assert_eq!(node.log.len(), 4);
        assert_eq!(node.get_log_entry(4).map(|e| e.index), Some(4));
        assert_eq!(node.get_log_entry(1).map(|e| e.index), Some(1));
        assert_eq!(node.term_at(3), Some(1));
    }

    #[test]
    #[should_panic(expected = "failed to persist snapshot")]
    fn test_failed_automatic_snapshot_halts() {
        let mut node = new_core_on_full_disk(1, &[]);
        node.set_snapshot_threshold(2);
        make_leader(&mut node);

        let (tx, _rx) = oneshot::channel();
        node.propose(EntryPayload::Noop, tx);
    }
}
