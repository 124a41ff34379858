//! Read and write transactions over store snapshots

use std::collections::HashMap;
use std::sync::Arc;

use super::index::{By, Table};
use super::object::{Object, ObjectKind};
use super::{StoreAction, StoreError};

/// Immutable set of per-kind tables. Cloning is cheap; a table is copied
/// only when a writer first touches it.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    tables: HashMap<ObjectKind, Arc<Table>>,
}

impl Tables {
    pub fn table(&self, kind: ObjectKind) -> Option<&Table> {
        self.tables.get(&kind).map(|t| t.as_ref())
    }

    pub(crate) fn table_mut(&mut self, kind: ObjectKind) -> &mut Table {
        Arc::make_mut(self.tables.entry(kind).or_default())
    }

    pub fn get(&self, kind: ObjectKind, id: &str) -> Option<&Object> {
        self.table(kind)?.get(id)
    }

    /// All objects ordered by kind, then id
    pub fn objects(&self) -> Vec<Object> {
        ObjectKind::ALL
            .iter()
            .filter_map(|k| self.table(*k))
            .flat_map(|t| t.iter().cloned())
            .collect()
    }

    pub fn from_objects(objects: impl IntoIterator<Item = Object>) -> Self {
        let mut tables = Tables::default();
        for obj in objects {
            tables.table_mut(obj.kind()).put(obj);
        }
        tables
    }

    /// Rejects `object` if another object of its kind already holds its name
    pub(crate) fn check_name(&self, object: &Object) -> Result<(), StoreError> {
        let kind = object.kind();
        if !kind.unique_names() || object.name().is_empty() {
            return Ok(());
        }
        match self.table(kind).and_then(|t| t.id_by_name(object.name())) {
            Some(holder) if holder != object.id() => Err(StoreError::NameConflict {
                kind,
                name: object.name().to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Read access shared by both transaction types
pub trait StoreRead {
    fn tables(&self) -> &Tables;

    /// Copy of the object, if present
    fn get(&self, kind: ObjectKind, id: &str) -> Option<Object> {
        self.tables().get(kind, id).cloned()
    }

    fn find(&self, kind: ObjectKind, by: &By) -> Vec<Object> {
        self.tables().table(kind).map(|t| t.find(by)).unwrap_or_default()
    }

    fn list(&self, kind: ObjectKind) -> Vec<Object> {
        self.find(kind, &By::All)
    }

    fn count(&self, kind: ObjectKind) -> usize {
        self.tables().table(kind).map_or(0, Table::len)
    }
}

/// Point-in-time view. Holding one never blocks the apply path.
pub struct ReadTx {
    tables: Arc<Tables>,
    index: u64,
}

impl ReadTx {
    pub(crate) fn new(tables: Arc<Tables>, index: u64) -> Self {
        Self { tables, index }
    }

    /// Log index the view reflects
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl StoreRead for ReadTx {
    fn tables(&self) -> &Tables {
        &self.tables
    }
}

/// Staged writes on top of a snapshot.
///
/// Reads observe the transaction's own writes. Successive writes to one
/// object collapse into a single action.
pub struct WriteTx {
    tables: Tables,
    actions: Vec<Option<StoreAction>>,
    staged: HashMap<(ObjectKind, String), usize>,
}

impl WriteTx {
    pub(crate) fn new(base: &Tables) -> Self {
        Self {
            tables: base.clone(),
            actions: Vec::new(),
            staged: HashMap::new(),
        }
    }

    pub fn create(&mut self, object: impl Into<Object>) -> Result<(), StoreError> {
        let mut object = object.into();
        let kind = object.kind();
        if object.id().is_empty() {
            return Err(StoreError::InvalidObject(format!("{} without id", kind)));
        }
        if self.tables.get(kind, object.id()).is_some() {
            return Err(StoreError::Exists { kind, id: object.id().to_string() });
        }
        self.tables.check_name(&object)?;
        object.set_version(0);
        self.tables.table_mut(kind).put(object.clone());
        self.stage(StoreAction::Create(object));
        Ok(())
    }

    /// Replace an object. `object.meta.version` must be the version that was read.
    pub fn update(&mut self, object: impl Into<Object>) -> Result<(), StoreError> {
        let object = object.into();
        let kind = object.kind();
        let current = self
            .tables
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
        self.tables.check_name(&object)?;
        self.tables.table_mut(kind).put(object.clone());
        self.stage(StoreAction::Update(object));
        Ok(())
    }

    pub fn delete(&mut self, kind: ObjectKind, id: &str) -> Result<(), StoreError> {
        if self.tables.table_mut(kind).remove(id).is_none() {
            return Err(StoreError::NotFound { kind, id: id.to_string() });
        }
        self.stage(StoreAction::Delete { kind, id: id.to_string() });
        Ok(())
    }

    fn stage(&mut self, action: StoreAction) {
        let key = (action.kind(), action.id().to_string());
        let Some(&pos) = self.staged.get(&key) else {
            self.staged.insert(key, self.actions.len());
            self.actions.push(Some(action));
            return;
        };

        let merged = match (self.actions[pos].take(), action) {
            (Some(StoreAction::Create(_)), StoreAction::Update(obj)) => Some(StoreAction::Create(obj)),
            (Some(StoreAction::Create(_)), StoreAction::Delete { .. }) => None,
            (Some(StoreAction::Update(_)), next) => Some(next),
            (previous, next) => {
                // delete followed by create: both must reach the log
                self.actions[pos] = previous;
                self.staged.insert(key, self.actions.len());
                self.actions.push(Some(next));
                return;
            }
        };
        if merged.is_none() {
            self.staged.remove(&key);
        }
        self.actions[pos] = merged;
    }

    /// Actions in the order they were first staged
    pub fn into_actions(self) -> Vec<StoreAction> {
        self.actions.into_iter().flatten().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(Option::is_none)
    }
}

impl StoreRead for WriteTx {
    fn tables(&self) -> &Tables {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Network, Service, Task};

    #[test]
    fn test_reads_see_own_writes() {
        let mut tx = WriteTx::new(&Tables::default());
        tx.create(Task::new("t1", "svc")).unwrap();
        assert!(tx.get(ObjectKind::Task, "t1").is_some());
        assert_eq!(tx.find(ObjectKind::Task, &By::ServiceId("svc".into())).len(), 1);
    }

    #[test]
    fn test_create_then_update_collapses_to_create() {
        let mut tx = WriteTx::new(&Tables::default());
        tx.create(Task::new("t1", "svc")).unwrap();
        let mut task = Task::new("t1", "svc");
        task.slot = 3;
        tx.update(task).unwrap();

        let actions = tx.into_actions();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            StoreAction::Create(Object::Task(t)) => assert_eq!(t.slot, 3),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_create_then_delete_cancels_out() {
        let mut tx = WriteTx::new(&Tables::default());
        tx.create(Network::new("n1", "overlay")).unwrap();
        tx.delete(ObjectKind::Network, "n1").unwrap();
        assert!(tx.is_empty());
        assert!(tx.into_actions().is_empty());
    }

    #[test]
    fn test_delete_then_create_keeps_both() {
        let base = Tables::from_objects(vec![Object::Task(Task::new("t1", "old"))]);
        let mut tx = WriteTx::new(&base);
        tx.delete(ObjectKind::Task, "t1").unwrap();
        tx.create(Task::new("t1", "new")).unwrap();

        let actions = tx.into_actions();
        assert!(matches!(actions[0], StoreAction::Delete { .. }));
        assert!(matches!(actions[1], StoreAction::Create(_)));
    }

    #[test]
    fn test_stale_version_rejected() {
        let mut stored = Task::new("t1", "svc");
        stored.meta.version = 7;
        let base = Tables::from_objects(vec![Object::Task(stored)]);
        let mut tx = WriteTx::new(&base);

        let err = tx.update(Task::new("t1", "svc")).unwrap_err();
        assert!(matches!(err, StoreError::SequenceConflict { expected: 0, actual: 7, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_duplicate_service_name_rejected() {
        let mut tx = WriteTx::new(&Tables::default());
        tx.create(Service::new("s1", "web")).unwrap();
        let err = tx.create(Service::new("s2", "WEB")).unwrap_err();
        assert!(matches!(err, StoreError::NameConflict { .. }));
    }

    #[test]
    fn test_base_snapshot_untouched() {
        let base = Tables::from_objects(vec![Object::Task(Task::new("t1", "svc"))]);
        let mut tx = WriteTx::new(&base);
        tx.delete(ObjectKind::Task, "t1").unwrap();
        assert!(base.get(ObjectKind::Task, "t1").is_some());
    }
}
