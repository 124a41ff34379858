//! Cluster objects held by the store
//!
//! Every kind exposes the same capability set (id, version, indexable keys),
//! so the store itself never switches on concrete types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::index::IndexKey;

/// Object kind tag, used to pick a table and for watch matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Node,
    Task,
    Service,
    Network,
    Cluster,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::Node,
        ObjectKind::Task,
        ObjectKind::Service,
        ObjectKind::Network,
        ObjectKind::Cluster,
    ];

    /// Kinds whose names must be unique within their table
    pub fn unique_names(self) -> bool {
        matches!(self, ObjectKind::Service | ObjectKind::Network | ObjectKind::Cluster)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Node => "node",
            ObjectKind::Task => "task",
            ObjectKind::Service => "service",
            ObjectKind::Network => "network",
            ObjectKind::Cluster => "cluster",
        };
        f.write_str(name)
    }
}

/// Store-managed metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Log index of the entry that last wrote this object
    pub version: u64,
}

/// User-facing name and labels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeRole {
    Manager,
    Worker,
}

/// Whether a node has been admitted to the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeMembership {
    #[default]
    Pending,
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Running,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub meta: Meta,
    pub annotations: Annotations,
    pub role: NodeRole,
    #[serde(default)]
    pub membership: NodeMembership,
    pub addr: String,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            annotations: Annotations { name: name.into(), ..Default::default() },
            role,
            membership: NodeMembership::Pending,
            addr: String::new(),
        }
    }

    pub fn accepted(mut self) -> Self {
        self.membership = NodeMembership::Accepted;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub meta: Meta,
    pub annotations: Annotations,
    pub service_id: String,
    pub node_id: Option<String>,
    pub slot: u64,
    pub desired_state: TaskState,
}

impl Task {
    pub fn new(id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            annotations: Annotations::default(),
            service_id: service_id.into(),
            node_id: None,
            slot: 0,
            desired_state: TaskState::New,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub meta: Meta,
    pub annotations: Annotations,
    pub image: String,
    pub replicas: u64,
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            annotations: Annotations { name: name.into(), ..Default::default() },
            image: String::new(),
            replicas: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub meta: Meta,
    pub annotations: Annotations,
    pub driver: String,
}

impl Network {
    pub fn new(id: impl Into<String>, driver: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            annotations: Annotations { name: id.clone(), ..Default::default() },
            id,
            meta: Meta::default(),
            driver: driver.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub meta: Meta,
    pub annotations: Annotations,
}

impl Cluster {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            annotations: Annotations { name: name.into(), ..Default::default() },
        }
    }
}

/// Any object the store can hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "object")]
pub enum Object {
    Node(Node),
    Task(Task),
    Service(Service),
    Network(Network),
    Cluster(Cluster),
}

macro_rules! each_object {
    ($obj:expr, $o:ident => $body:expr) => {
        match $obj {
            Object::Node($o) => $body,
            Object::Task($o) => $body,
            Object::Service($o) => $body,
            Object::Network($o) => $body,
            Object::Cluster($o) => $body,
        }
    };
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Node(_) => ObjectKind::Node,
            Object::Task(_) => ObjectKind::Task,
            Object::Service(_) => ObjectKind::Service,
            Object::Network(_) => ObjectKind::Network,
            Object::Cluster(_) => ObjectKind::Cluster,
        }
    }

    pub fn id(&self) -> &str {
        each_object!(self, o => &o.id)
    }

    pub fn version(&self) -> u64 {
        each_object!(self, o => o.meta.version)
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        each_object!(self, o => o.meta.version = version)
    }

    pub fn annotations(&self) -> &Annotations {
        each_object!(self, o => &o.annotations)
    }

    pub fn name(&self) -> &str {
        &self.annotations().name
    }

    /// Secondary index keys derived from this object's fields
    pub fn index_keys(&self) -> Vec<IndexKey> {
        let mut keys = Vec::new();
        let annotations = self.annotations();
        if !annotations.name.is_empty() {
            keys.push(IndexKey::Name(annotations.name.to_lowercase()));
        }
        for (k, v) in &annotations.labels {
            keys.push(IndexKey::Label(k.clone(), v.clone()));
        }
        match self {
            Object::Node(n) => {
                keys.push(IndexKey::Role(n.role));
                keys.push(IndexKey::Membership(n.membership));
            }
            Object::Task(t) => {
                keys.push(IndexKey::ServiceId(t.service_id.clone()));
                if let Some(node_id) = &t.node_id {
                    keys.push(IndexKey::NodeId(node_id.clone()));
                }
                keys.push(IndexKey::DesiredState(t.desired_state));
            }
            Object::Service(_) | Object::Network(_) | Object::Cluster(_) => {}
        }
        keys
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            Object::Task(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Object::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            Object::Service(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Node> for Object {
    fn from(o: Node) -> Self {
        Object::Node(o)
    }
}

impl From<Task> for Object {
    fn from(o: Task) -> Self {
        Object::Task(o)
    }
}

impl From<Service> for Object {
    fn from(o: Service) -> Self {
        Object::Service(o)
    }
}

impl From<Network> for Object {
    fn from(o: Network) -> Self {
        Object::Network(o)
    }
}

impl From<Cluster> for Object {
    fn from(o: Cluster) -> Self {
        Object::Cluster(o)
    }
}
