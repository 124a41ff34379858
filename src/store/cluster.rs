//! The cluster-wide configuration object
//!
//! Managers create a single `Cluster` named `DEFAULT_CLUSTER_NAME` once the
//! first leader is elected. Everything else waits for it to be committed
//! before reading cluster-wide settings.

use std::time::Duration;

use tracing::debug;

use super::index::By;
use super::memory::MemoryStore;
use super::object::{Cluster, Object, ObjectKind};
use super::StoreError;
use crate::core::raft_server::RaftError;
use crate::watch::{EventAction, Matcher};

pub const DEFAULT_CLUSTER_NAME: &str = "default";

fn is_default(object: &Object) -> bool {
    matches!(object, Object::Cluster(c) if c.annotations.name.eq_ignore_ascii_case(DEFAULT_CLUSTER_NAME))
}

/// Wait until the default cluster object is applied locally and return it.
///
/// Fails with `Timeout` if it does not show up within `timeout`, or with
/// `Shutdown` if the store's event queue closes first.
pub async fn wait_for_cluster(store: &MemoryStore, timeout: Duration) -> Result<Cluster, StoreError> {
    // Subscribe before looking so a create landing in between is not missed
    let matcher = Matcher::kind_action(ObjectKind::Cluster, EventAction::Create)
        .and(Matcher::predicate(|event| event.new.as_ref().is_some_and(is_default)));
    let (mut events, _cancel) = store.watch(matcher);

    let existing = store.find(ObjectKind::Cluster, &By::Name(DEFAULT_CLUSTER_NAME.to_string()));
    if let Some(Object::Cluster(cluster)) = existing.into_iter().next() {
        return Ok(cluster);
    }

    debug!(timeout_ms = timeout.as_millis() as u64, "waiting for cluster object");
    match tokio::time::timeout(timeout, events.recv()).await {
        Ok(Some(event)) => match event.new {
            Some(Object::Cluster(cluster)) => Ok(cluster),
            _ => Err(StoreError::InvalidObject("cluster event without an object".to_string())),
        },
        Ok(None) => Err(RaftError::Shutdown.into()),
        Err(_) => Err(RaftError::Timeout.into()),
    }
}
