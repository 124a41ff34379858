//! Replicated consensus store for a cluster orchestrator control plane
//!
//! Cluster objects live in an in-memory `store::MemoryStore`. Writes are
//! replicated through a Raft log (`core`) before they are applied, and every
//! applied change is fanned out to `watch` subscribers.

pub mod core;
pub mod state_machine;
pub mod storage;
pub mod store;
pub mod transport;
pub mod watch;

/// Testing utilities for integration tests.
pub mod testing;
