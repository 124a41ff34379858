//! Composable predicates over watch events

use std::fmt;
use std::sync::Arc;

use super::event::{EventAction, WatchEvent};
use crate::store::ObjectKind;

type PredicateFn = Arc<dyn Fn(&WatchEvent) -> bool + Send + Sync>;

/// Selects which events a subscription receives
#[derive(Clone)]
pub enum Matcher {
    /// Every event
    All,
    Action(EventAction),
    Kind(ObjectKind),
    Id(String),
    /// Arbitrary predicate over the event and its object fields
    Predicate(PredicateFn),
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
    Not(Box<Matcher>),
}

impl Matcher {
    pub fn kind(kind: ObjectKind) -> Self {
        Matcher::Kind(kind)
    }

    /// Events of `kind` with the given action, e.g. task creations
    pub fn kind_action(kind: ObjectKind, action: EventAction) -> Self {
        Matcher::And(vec![Matcher::Kind(kind), Matcher::Action(action)])
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&WatchEvent) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(f))
    }

    pub fn and(self, other: Matcher) -> Self {
        match self {
            Matcher::And(mut all) => {
                all.push(other);
                Matcher::And(all)
            }
            m => Matcher::And(vec![m, other]),
        }
    }

    pub fn or(self, other: Matcher) -> Self {
        match self {
            Matcher::Or(mut any) => {
                any.push(other);
                Matcher::Or(any)
            }
            m => Matcher::Or(vec![m, other]),
        }
    }

    pub fn negate(self) -> Self {
        Matcher::Not(Box::new(self))
    }

    pub fn matches(&self, event: &WatchEvent) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Action(action) => event.action == *action,
            Matcher::Kind(kind) => event.kind == *kind,
            Matcher::Id(id) => event.id() == id,
            Matcher::Predicate(f) => f(event),
            Matcher::And(all) => all.iter().all(|m| m.matches(event)),
            Matcher::Or(any) => any.iter().any(|m| m.matches(event)),
            Matcher::Not(m) => !m.matches(event),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::All => write!(f, "All"),
            Matcher::Action(a) => write!(f, "Action({:?})", a),
            Matcher::Kind(k) => write!(f, "Kind({:?})", k),
            Matcher::Id(id) => write!(f, "Id({})", id),
            Matcher::Predicate(_) => write!(f, "Predicate(..)"),
            Matcher::And(all) => f.debug_tuple("And").field(all).finish(),
            Matcher::Or(any) => f.debug_tuple("Or").field(any).finish(),
            Matcher::Not(m) => f.debug_tuple("Not").field(m).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Network, Object, Task};

    fn task_event(action: EventAction) -> WatchEvent {
        let task = Object::Task(Task::new("t1", "svc-a"));
        match action {
            EventAction::Create => WatchEvent::created(1, task),
            EventAction::Update => WatchEvent::updated(2, task.clone(), task),
            EventAction::Delete => WatchEvent::deleted(3, task),
        }
    }

    #[test]
    fn test_kind_action_matcher() {
        let m = Matcher::kind_action(ObjectKind::Task, EventAction::Create);
        assert!(m.matches(&task_event(EventAction::Create)));
        assert!(!m.matches(&task_event(EventAction::Delete)));
        let net = WatchEvent::created(1, Object::Network(Network::new("n1", "overlay")));
        assert!(!m.matches(&net));
    }

    #[test]
    fn test_predicate_over_fields() {
        let m = Matcher::kind(ObjectKind::Task).and(Matcher::predicate(|e| {
            matches!(e.object(), Object::Task(t) if t.service_id == "svc-a")
        }));
        assert!(m.matches(&task_event(EventAction::Update)));
    }

    #[test]
    fn test_or_and_not() {
        let m = Matcher::Action(EventAction::Create).or(Matcher::Action(EventAction::Delete));
        assert!(m.matches(&task_event(EventAction::Delete)));
        assert!(!m.clone().negate().matches(&task_event(EventAction::Create)));
        assert!(Matcher::Id("t1".into()).matches(&task_event(EventAction::Update)));
    }
}
