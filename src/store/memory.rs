//! In-memory object store driven by the consensus apply path

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::index::By;
use super::object::{Object, ObjectKind};
use super::tx::{ReadTx, StoreRead, Tables, WriteTx};
use super::{Proposer, StoreAction, StoreError};
use crate::state_machine::{ApplyResult, Snapshotable, StateMachine};
use crate::watch::{Matcher, Subscription, CancelHandle, WatchEvent, WatchQueue};

struct State {
    tables: Arc<Tables>,
    applied_index: u64,
}

struct Inner {
    state: RwLock<State>,
    queue: WatchQueue,
    proposer: OnceLock<Arc<dyn Proposer>>,
}

/// Versioned, indexed store of cluster objects. Cloning shares the store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    objects: Vec<Object>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    tables: Arc::new(Tables::default()),
                    applied_index: 0,
                }),
                queue: WatchQueue::new(),
                proposer: OnceLock::new(),
            }),
        }
    }

    /// Attach the consensus handle that `update` proposes through.
    /// Only the first call has an effect.
    pub fn set_proposer(&self, proposer: Arc<dyn Proposer>) {
        if self.inner.proposer.set(proposer).is_err() {
            warn!("store proposer already set, ignoring");
        }
    }

    fn proposer(&self) -> Result<&Arc<dyn Proposer>, StoreError> {
        self.inner.proposer.get().ok_or(StoreError::NoProposer)
    }

    fn snapshot_tables(&self) -> (Arc<Tables>, u64) {
        let state = self.inner.state.read();
        (state.tables.clone(), state.applied_index)
    }

    /// Run `f` against a point-in-time snapshot
    pub fn view<R>(&self, f: impl FnOnce(&ReadTx) -> R) -> R {
        let (tables, index) = self.snapshot_tables();
        f(&ReadTx::new(tables, index))
    }

    /// Like `view`, but first confirms with a quorum that every write
    /// committed before this call is visible.
    pub async fn linearizable_view<R>(&self, f: impl FnOnce(&ReadTx) -> R) -> Result<R, StoreError> {
        self.proposer()?.read_barrier().await?;
        Ok(self.view(f))
    }

    pub fn get(&self, kind: ObjectKind, id: &str) -> Option<Object> {
        self.view(|tx| tx.get(kind, id))
    }

    pub fn find(&self, kind: ObjectKind, by: &By) -> Vec<Object> {
        self.view(|tx| tx.find(kind, by))
    }

    /// Run `f` against the latest state and replicate what it staged.
    ///
    /// Returns once the resulting entry has been applied locally. `f` must not
    /// have side effects outside the transaction; callers retry it on
    /// retryable errors.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut WriteTx) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let proposer = self.proposer()?;
        let (tables, _) = self.snapshot_tables();
        let mut tx = WriteTx::new(&tables);
        let out = f(&mut tx)?;
        if tx.is_empty() {
            return Ok(out);
        }
        proposer.propose_actions(tx.into_actions()).await?;
        Ok(out)
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.state.read().applied_index
    }

    pub fn queue(&self) -> &WatchQueue {
        &self.inner.queue
    }

    pub fn watch(&self, matcher: Matcher) -> (Subscription, CancelHandle) {
        self.inner.queue.subscribe(matcher)
    }

    /// Apply one committed entry. Either every action takes effect or none does;
    /// events are published only on success.
    pub fn apply_actions(&self, index: u64, actions: &[StoreAction]) -> Result<(), StoreError> {
        let (base, _) = self.snapshot_tables();
        let mut next = (*base).clone();
        let mut events = Vec::with_capacity(actions.len());

        let outcome = actions
            .iter()
            .try_for_each(|action| apply_one(&mut next, index, action, &mut events));

        {
            let mut state = self.inner.state.write();
            if outcome.is_ok() {
                state.tables = Arc::new(next);
            }
            state.applied_index = state.applied_index.max(index);
        }

        match outcome {
            Ok(()) => {
                debug!(index, events = events.len(), "applied store actions");
                self.inner.queue.publish(events);
                Ok(())
            }
            Err(e) => {
                debug!(index, error = %e, "rejected store actions");
                Err(e)
            }
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let (tables, _) = self.snapshot_tables();
        let snapshot = StoreSnapshot { objects: tables.objects() };
        serde_json::to_vec(&snapshot).map_err(|e| StoreError::Snapshot(e.to_string()))
    }

    fn decode(&self, data: &[u8], index: u64) -> Result<(), StoreError> {
        let snapshot: StoreSnapshot =
            serde_json::from_slice(data).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        let tables = Tables::from_objects(snapshot.objects);
        let mut state = self.inner.state.write();
        state.tables = Arc::new(tables);
        state.applied_index = index;
        Ok(())
    }
}

fn apply_one(
    tables: &mut Tables,
    index: u64,
    action: &StoreAction,
    events: &mut Vec<WatchEvent>,
) -> Result<(), StoreError> {
    match action {
        StoreAction::Create(object) => {
            let kind = object.kind();
            if tables.get(kind, object.id()).is_some() {
                return Err(StoreError::Exists { kind, id: object.id().to_string() });
            }
            tables.check_name(object)?;
            let mut object = object.clone();
            object.set_version(index);
            tables.table_mut(kind).put(object.clone());
            events.push(WatchEvent::created(index, object));
        }
        StoreAction::Update(object) => {
            let kind = object.kind();
            let current = tables
                .get(kind, object.id())
                .ok_or_else(|| StoreError::NotFound { kind, id: object.id().to_string() })?;
            if current.version() != object.version() {
                return Err(StoreError::SequenceConflict {
                    kind,
                    id: object.id().to_string(),
                    expected: object.version(),
                    actual: current.version(),
                });
            }
            tables.check_name(object)?;
            let mut object = object.clone();
            object.set_version(index);
            let old = tables.table_mut(kind).put(object.clone());
            if let Some(old) = old {
                events.push(WatchEvent::updated(index, old, object));
            }
        }
        StoreAction::Delete { kind, id } => {
            let old = tables
                .table_mut(*kind)
                .remove(id)
                .ok_or_else(|| StoreError::NotFound { kind: *kind, id: id.clone() })?;
            events.push(WatchEvent::deleted(index, old));
        }
    }
    Ok(())
}

impl StateMachine for MemoryStore {
    fn apply(&mut self, index: u64, actions: &[StoreAction]) -> ApplyResult {
        self.apply_actions(index, actions)
    }
}

impl Snapshotable for MemoryStore {
    fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        self.encode()
    }

    fn restore(&mut self, data: &[u8], index: u64) -> Result<(), StoreError> {
        self.decode(data, index)
    }
}
