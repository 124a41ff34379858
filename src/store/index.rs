//! Per-kind tables with secondary indexes

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::object::{NodeMembership, NodeRole, Object, TaskState};

/// Key under which an object is indexed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// Lowercased name
    Name(String),
    Role(NodeRole),
    Membership(NodeMembership),
    ServiceId(String),
    NodeId(String),
    DesiredState(TaskState),
    Label(String, String),
}

/// Selector for `find`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum By {
    All,
    IdPrefix(String),
    /// Case-insensitive exact name
    Name(String),
    NamePrefix(String),
    Role(NodeRole),
    Membership(NodeMembership),
    ServiceId(String),
    NodeId(String),
    DesiredState(TaskState),
    Label(String, String),
    /// Union of several selectors
    Or(Vec<By>),
}

/// Objects of one kind, keyed by id
#[derive(Debug, Clone, Default)]
pub struct Table {
    objects: BTreeMap<String, Object>,
    indexes: HashMap<IndexKey, BTreeSet<String>>,
}

impl Table {
    pub fn get(&self, id: &str) -> Option<&Object> {
        self.objects.get(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Insert or replace, keeping indexes in sync
    pub fn put(&mut self, object: Object) -> Option<Object> {
        let id = object.id().to_string();
        let old = self.remove(&id);
        for key in object.index_keys() {
            self.indexes.entry(key).or_default().insert(id.clone());
        }
        self.objects.insert(id, object);
        old
    }

    pub fn remove(&mut self, id: &str) -> Option<Object> {
        let old = self.objects.remove(id)?;
        for key in old.index_keys() {
            if let Some(ids) = self.indexes.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.indexes.remove(&key);
                }
            }
        }
        Some(old)
    }

    /// Id of the object holding `name` (case-insensitive), if any
    pub fn id_by_name(&self, name: &str) -> Option<&str> {
        self.indexes
            .get(&IndexKey::Name(name.to_lowercase()))
            .and_then(|ids| ids.iter().next())
            .map(String::as_str)
    }

    /// Ids matching the selector, in id order
    pub fn find_ids(&self, by: &By) -> BTreeSet<String> {
        match by {
            By::All => self.objects.keys().cloned().collect(),
            By::IdPrefix(prefix) => self
                .objects
                .range(prefix.clone()..)
                .take_while(|(id, _)| id.starts_with(prefix.as_str()))
                .map(|(id, _)| id.clone())
                .collect(),
            By::NamePrefix(prefix) => {
                let prefix = prefix.to_lowercase();
                self.indexes
                    .iter()
                    .filter(|(key, _)| matches!(key, IndexKey::Name(n) if n.starts_with(&prefix)))
                    .flat_map(|(_, ids)| ids.iter().cloned())
                    .collect()
            }
            By::Or(all) => all.iter().flat_map(|b| self.find_ids(b)).collect(),
            By::Name(name) => self.lookup(&IndexKey::Name(name.to_lowercase())),
            By::Role(role) => self.lookup(&IndexKey::Role(*role)),
            By::Membership(membership) => self.lookup(&IndexKey::Membership(*membership)),
            By::ServiceId(id) => self.lookup(&IndexKey::ServiceId(id.clone())),
            By::NodeId(id) => self.lookup(&IndexKey::NodeId(id.clone())),
            By::DesiredState(state) => self.lookup(&IndexKey::DesiredState(*state)),
            By::Label(k, v) => self.lookup(&IndexKey::Label(k.clone(), v.clone())),
        }
    }

    fn lookup(&self, key: &IndexKey) -> BTreeSet<String> {
        self.indexes.get(key).cloned().unwrap_or_default()
    }

    pub fn find(&self, by: &By) -> Vec<Object> {
        self.find_ids(by)
            .into_iter()
            .filter_map(|id| self.objects.get(&id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Node, Service, Task};

    fn task(id: &str, service: &str, node: Option<&str>) -> Object {
        let mut t = Task::new(id, service);
        t.node_id = node.map(String::from);
        Object::Task(t)
    }

    #[test]
    fn test_put_replaces_index_entries() {
        let mut table = Table::default();
        table.put(task("t1", "svc-a", Some("n1")));
        table.put(task("t1", "svc-b", None));

        assert!(table.find_ids(&By::ServiceId("svc-a".into())).is_empty());
        assert!(table.find_ids(&By::NodeId("n1".into())).is_empty());
        assert_eq!(table.find(&By::ServiceId("svc-b".into())).len(), 1);
    }

    #[test]
    fn test_remove_drops_index_entries() {
        let mut table = Table::default();
        table.put(task("t1", "svc", None));
        assert!(table.remove("t1").is_some());
        assert!(table.remove("t1").is_none());
        assert!(table.find_ids(&By::ServiceId("svc".into())).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_prefix_and_or_selectors() {
        let mut table = Table::default();
        table.put(Object::Service(Service::new("abc1", "Frontend")));
        table.put(Object::Service(Service::new("abd2", "front-proxy")));
        table.put(Object::Service(Service::new("xyz", "backend")));

        assert_eq!(table.find_ids(&By::IdPrefix("ab".into())).len(), 2);
        assert_eq!(table.find_ids(&By::NamePrefix("FRONT".into())).len(), 2);
        assert_eq!(table.id_by_name("BACKEND"), Some("xyz"));

        let either = By::Or(vec![By::Name("backend".into()), By::IdPrefix("abc".into())]);
        let ids: Vec<String> = table.find_ids(&either).into_iter().collect();
        assert_eq!(ids, vec!["abc1".to_string(), "xyz".to_string()]);
    }

    #[test]
    fn test_role_index() {
        let mut table = Table::default();
        table.put(Object::Node(Node::new("n1", "m1", NodeRole::Manager)));
        table.put(Object::Node(Node::new("n2", "w1", NodeRole::Worker)));
        assert_eq!(table.find(&By::Role(NodeRole::Worker))[0].id(), "n2");
    }

    #[test]
    fn test_membership_index_follows_acceptance() {
        let mut table = Table::default();
        table.put(Object::Node(Node::new("n1", "m1", NodeRole::Manager).accepted()));
        table.put(Object::Node(Node::new("n2", "w1", NodeRole::Worker)));
        table.put(Object::Node(Node::new("n3", "w2", NodeRole::Worker)));

        let pending: Vec<String> = table.find_ids(&By::Membership(NodeMembership::Pending)).into_iter().collect();
        assert_eq!(pending, vec!["n2".to_string(), "n3".to_string()]);

        table.put(Object::Node(Node::new("n2", "w1", NodeRole::Worker).accepted()));
        assert_eq!(table.find(&By::Membership(NodeMembership::Accepted)).len(), 2);
        assert_eq!(table.find(&By::Membership(NodeMembership::Pending))[0].id(), "n3");
    }
}
