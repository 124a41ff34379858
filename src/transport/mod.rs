//! Transport layer for Raft RPC communication
//!
//! - `InMemoryTransport`: direct calls through a shared `InMemoryNetwork`, for tests
//! - `HttpTransport`: HTTP/JSON transport for production
//! - `RaftService`: the receiving side both of them dispatch to

pub mod http;
pub mod inmemory;
pub mod service;
pub mod traits;

pub use service::RaftService;
pub use traits::{
    JoinAccepted, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, Transport, TransportError,
};
