//! Change events published after each committed log entry

use serde::{Deserialize, Serialize};

use crate::store::{Object, ObjectKind};

/// What happened to the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

/// A single object change, immutable once published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: EventAction,
    pub kind: ObjectKind,
    /// Log index of the entry that produced this event
    pub index: u64,
    /// Object before the change (None for create)
    pub old: Option<Object>,
    /// Object after the change (None for delete)
    pub new: Option<Object>,
}

impl WatchEvent {
    pub fn created(index: u64, object: Object) -> Self {
        Self { action: EventAction::Create, kind: object.kind(), index, old: None, new: Some(object) }
    }

    pub fn updated(index: u64, old: Object, new: Object) -> Self {
        Self { action: EventAction::Update, kind: new.kind(), index, old: Some(old), new: Some(new) }
    }

    pub fn deleted(index: u64, old: Object) -> Self {
        Self { action: EventAction::Delete, kind: old.kind(), index, old: Some(old), new: None }
    }

    /// The most recent view of the object: the new value, or the old one for deletes
    pub fn object(&self) -> &Object {
        match (&self.new, &self.old) {
            (Some(obj), _) => obj,
            (None, Some(obj)) => obj,
            (None, None) => unreachable!("watch event without an object"),
        }
    }

    pub fn id(&self) -> &str {
        self.object().id()
    }
}
