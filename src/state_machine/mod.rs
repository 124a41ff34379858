//! State machine layer for Raft
//!
//! The replicated object store (`crate::store::MemoryStore`) is the only
//! implementation; the traits keep the consensus core independent of it.

pub mod traits;

pub use traits::{ApplyResult, Snapshotable, StateMachine};
