//! Testing utilities for Raft cluster integration tests
//!
//! `TestCluster` runs in-process nodes over an `InMemoryNetwork`. Each node's
//! storage outlives its server, so a node can crash and restart from what it
//! persisted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::config::RaftConfig;
use crate::core::membership::PeerInfo;
use crate::core::raft_core::{LogEntry, RaftCore, RaftState};
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::core::snapshot::Snapshot;
use crate::storage::memory::MemoryStorage;
use crate::storage::{HardState, Storage, StorageError};
use crate::store::MemoryStore;
use crate::transport::inmemory::InMemoryNetwork;
use crate::transport::RaftService;

/// Memory storage that survives a simulated crash. Cloning shares it.
#[derive(Clone, Default)]
pub struct CrashSafeStorage {
    inner: Arc<Mutex<MemoryStorage>>,
}

impl Storage for CrashSafeStorage {
    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        self.inner.lock().load_hard_state()
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.inner.lock().save_hard_state(state)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        self.inner.lock().load_log()
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.inner.lock().append_log_entries(entries)
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        self.inner.lock().truncate_log(from_index)
    }

    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError> {
        self.inner.lock().compact_log(before_index)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.inner.lock().load_snapshot()
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.inner.lock().save_snapshot(snapshot)
    }
}

/// A single running node
pub struct TestNode {
    pub id: u64,
    pub handle: RaftHandle,
    pub store: MemoryStore,
    storage: CrashSafeStorage,
}

/// A cluster of in-process Raft nodes
pub struct TestCluster {
    pub network: InMemoryNetwork,
    config: RaftConfig,
    nodes: BTreeMap<u64, TestNode>,
    /// Storage of crashed nodes, kept for `restart`
    crashed: BTreeMap<u64, CrashSafeStorage>,
}

impl TestCluster {
    /// Fast timings for tests
    pub fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(30))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
            .with_rpc_timeout(Duration::from_millis(100))
            .with_backoff(Duration::from_millis(20), Duration::from_millis(200))
            .with_proposal_timeout(Duration::from_secs(3))
    }

    /// Start `count` nodes that all founded the cluster together
    pub async fn new(count: u64) -> Self {
        Self::with_config(count, Self::test_config()).await
    }

    pub async fn with_config(count: u64, config: RaftConfig) -> Self {
        let mut cluster = TestCluster {
            network: InMemoryNetwork::new(),
            config,
            nodes: BTreeMap::new(),
            crashed: BTreeMap::new(),
        };
        let founders: Vec<PeerInfo> = (1..=count).map(|id| PeerInfo::new(id, InMemoryNetwork::addr(id))).collect();
        for id in 1..=count {
            let node = cluster.start_node(id, CrashSafeStorage::default(), &founders);
            cluster.nodes.insert(id, node);
        }
        cluster
    }

    fn start_node(&self, id: u64, storage: CrashSafeStorage, founders: &[PeerInfo]) -> TestNode {
        let store = MemoryStore::new();
        let mut core = RaftCore::new(id, Box::new(storage.clone()), Box::new(store.clone()))
            .expect("test storage is never corrupt");
        core.bootstrap(founders);

        let (server, _) = RaftServer::with_config(core, self.network.transport(id), self.config.clone());
        let handle = server.start();
        store.set_proposer(Arc::new(handle.clone()));
        self.network.register(id, RaftService::new(handle.clone()));

        TestNode { id, handle, store, storage }
    }

    /// Start a node outside the membership. It stays idle until it joins.
    pub fn add_node(&mut self, id: u64) -> &TestNode {
        let node = self.start_node(id, CrashSafeStorage::default(), &[]);
        self.nodes.entry(id).or_insert(node)
    }

    pub fn node(&self, id: u64) -> &TestNode {
        &self.nodes[&id]
    }

    pub fn handle(&self, id: u64) -> &RaftHandle {
        &self.nodes[&id].handle
    }

    pub fn store(&self, id: u64) -> &MemoryStore {
        &self.nodes[&id].store
    }

    /// IDs of running nodes
    pub fn ids(&self) -> Vec<u64> {
        self.nodes.keys().copied().collect()
    }

    /// Current leader among running nodes, preferring the highest term
    pub async fn leader(&self) -> Option<u64> {
        let mut best: Option<(u64, u64)> = None;
        for node in self.nodes.values() {
            let status = node.handle.status().await;
            if status.state == RaftState::Leader && best.map_or(true, |(term, _)| status.term > term) {
                best = Some((status.term, node.id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Wait until some running node is leader
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(id) = self.leader().await {
                return Some(id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Wait until every running node has applied `index`
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> bool {
        for node in self.nodes.values() {
            if node.handle.wait_for_applied(index, timeout).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Stop node `id` abruptly, keeping what it persisted
    pub async fn crash(&mut self, id: u64) {
        if let Some(node) = self.nodes.remove(&id) {
            self.network.isolate(id);
            self.network.unregister(id);
            node.handle.shutdown().await;
            self.crashed.insert(id, node.storage);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Bring a crashed node back from its storage
    pub fn restart(&mut self, id: u64) -> &TestNode {
        let storage = self.crashed.remove(&id).unwrap_or_default();
        self.network.heal(id);
        let node = self.start_node(id, storage, &[]);
        self.nodes.entry(id).or_insert(node)
    }

    pub fn isolate(&self, id: u64) {
        self.network.isolate(id);
    }

    pub fn heal(&self, id: u64) {
        self.network.heal(id);
    }

    /// Stop every node
    pub async fn shutdown(self) {
        for node in self.nodes.values() {
            node.handle.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
