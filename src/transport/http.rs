//! HTTP transport implementation for Raft RPC
//!
//! Uses axum for the server and reqwest for the client. When a cluster token
//! is configured, every request must carry it in the `x-cluster-token` header.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::warn;

use super::service::RaftService;
use super::{JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, Transport, TransportError};
use crate::core::membership::PeerInfo;
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, RaftStatus,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};

pub const TOKEN_HEADER: &str = "x-cluster-token";

/// HTTP transport for Raft RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: RwLock<HashMap<u64, String>>,
    /// HTTP client with the per-RPC timeout
    client: reqwest::Client,
    token: Option<String>,
    /// Join and leave wait for a commit, so they get a longer deadline
    membership_timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Codec(format!("cannot build http client: {}", e)))?;

        Ok(HttpTransport {
            peers: RwLock::new(peers),
            client,
            token: None,
            membership_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_membership_timeout(mut self, timeout: Duration) -> Self {
        self.membership_timeout = timeout;
        self
    }

    fn peer_addr(&self, target: u64) -> Result<String, TransportError> {
        self.peers.read().get(&target).cloned().ok_or(TransportError::NodeNotFound)
    }

    async fn post<A, R>(&self, addr: &str, path: &str, body: &A, timeout: Option<Duration>) -> Result<R, TransportError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", base_url(addr), path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed
            }
        })?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED => return Err(TransportError::Unauthorized),
            status if !status.is_success() => {
                return Err(TransportError::Codec(format!("unexpected status {}", status)))
            }
            _ => {}
        }

        response
            .json::<R>()
            .await
            .map_err(|e| TransportError::Codec(e.to_string()))
    }
}

fn base_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let addr = self.peer_addr(target)?;
        self.post(&addr, "/raft/request_vote", &args, None).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let addr = self.peer_addr(target)?;
        self.post(&addr, "/raft/append_entries", &args, None).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        let addr = self.peer_addr(target)?;
        self.post(&addr, "/raft/install_snapshot", &args, None).await
    }

    async fn timeout_now(
        &self,
        target: u64,
        args: TimeoutNowArgs,
    ) -> Result<TimeoutNowResult, TransportError> {
        let addr = self.peer_addr(target)?;
        self.post(&addr, "/raft/timeout_now", &args, None).await
    }

    async fn join_cluster(&self, addr: &str, req: JoinRequest) -> Result<JoinResponse, TransportError> {
        self.post(addr, "/raft/join", &req, Some(self.membership_timeout)).await
    }

    async fn leave_cluster(&self, addr: &str, req: LeaveRequest) -> Result<LeaveResponse, TransportError> {
        self.post(addr, "/raft/leave", &req, Some(self.membership_timeout)).await
    }

    fn sync_peers(&self, peers: &[PeerInfo]) {
        let mut book = self.peers.write();
        book.clear();
        book.extend(peers.iter().map(|p| (p.id, p.addr.clone())));
    }
}

/// Create an axum router for handling Raft RPCs
///
/// Request bodies up to `max_message_bytes` are accepted. Pass
/// `RaftConfig::max_message_bytes` so snapshots of a large store still fit.
pub fn create_router(service: RaftService, token: Option<String>, max_message_bytes: usize) -> Router {
    let router = Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .route("/raft/timeout_now", post(handle_timeout_now))
        .route("/raft/join", post(handle_join))
        .route("/raft/leave", post(handle_leave))
        .route("/raft/status", get(handle_status))
        .layer(DefaultBodyLimit::max(max_message_bytes))
        .with_state(service);

    match token {
        Some(token) => router.route_layer(middleware::from_fn_with_state(Arc::new(token), require_token)),
        None => router,
    }
}

async fn require_token(
    State(token): State<Arc<String>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = request
        .headers()
        .get(TOKEN_HEADER)
        .map(|v| v.as_bytes().ct_eq(token.as_bytes()).into())
        .unwrap_or(false);

    if !presented {
        warn!(path = %request.uri().path(), "rejected peer request with bad cluster token");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

async fn handle_request_vote(
    State(service): State<RaftService>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteResult> {
    Json(service.request_vote(args).await)
}

async fn handle_append_entries(
    State(service): State<RaftService>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesResult> {
    Json(service.append_entries(args).await)
}

async fn handle_install_snapshot(
    State(service): State<RaftService>,
    Json(args): Json<InstallSnapshotArgs>,
) -> Json<InstallSnapshotResult> {
    Json(service.install_snapshot(args).await)
}

async fn handle_timeout_now(
    State(service): State<RaftService>,
    Json(args): Json<TimeoutNowArgs>,
) -> Json<TimeoutNowResult> {
    Json(service.timeout_now(args).await)
}

async fn handle_join(State(service): State<RaftService>, Json(req): Json<JoinRequest>) -> Json<JoinResponse> {
    Json(service.join(req).await)
}

async fn handle_leave(State(service): State<RaftService>, Json(req): Json<LeaveRequest>) -> Json<LeaveResponse> {
    Json(service.leave(req).await)
}

async fn handle_status(State(service): State<RaftService>) -> Json<RaftStatus> {
    Json(service.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::membership::Membership;
    use crate::core::raft_core::RaftCore;
    use crate::core::RaftConfig;
    use crate::state_machine::Snapshotable;
    use crate::storage::memory::MemoryStorage;
    use crate::store::{MemoryStore, Object, ObjectKind, StoreAction, StoreRead, Task};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    async fn serve_core(id: u64, token: Option<String>) -> String {
        serve_store(id, token, MemoryStore::new()).await
    }

    async fn serve_store(id: u64, token: Option<String>, store: MemoryStore) -> String {
        let core = RaftCore::new(id, Box::new(MemoryStorage::new()), Box::new(store)).unwrap();
        let limit = RaftConfig::default().max_message_bytes;
        let router = create_router(RaftService::core_only(Arc::new(Mutex::new(core))), token, limit);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    fn vote_args() -> RequestVoteArgs {
        RequestVoteArgs { term: 1, candidate_id: 1, last_log_index: 0, last_log_term: 0 }
    }

    #[tokio::test]
    async fn test_http_request_vote() {
        let addr = serve_core(2, None).await;
        let transport = HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(5)).unwrap();

        let result = transport.request_vote(2, vote_args()).await.unwrap();

        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
    }

    #[tokio::test]
    async fn test_http_append_entries() {
        let addr = serve_core(2, None).await;
        let transport = HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(5)).unwrap();

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let result = transport.append_entries(2, args).await.unwrap();

        assert!(result.success);
        assert_eq!(result.term, 1);
    }

    #[tokio::test]
    async fn test_http_token_required() {
        let addr = serve_core(2, Some("secret".to_string())).await;

        let anonymous = HttpTransport::new(HashMap::from([(2, addr.clone())]), Duration::from_secs(5)).unwrap();
        assert_eq!(anonymous.request_vote(2, vote_args()).await.unwrap_err(), TransportError::Unauthorized);

        let wrong = HttpTransport::new(HashMap::from([(2, addr.clone())]), Duration::from_secs(5))
            .unwrap()
            .with_token("guess");
        assert_eq!(wrong.request_vote(2, vote_args()).await.unwrap_err(), TransportError::Unauthorized);

        let member = HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(5))
            .unwrap()
            .with_token("secret");
        assert!(member.request_vote(2, vote_args()).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_http_join_refused_without_server() {
        let addr = serve_core(2, None).await;
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(5)).unwrap();

        let response = transport
            .join_cluster(&addr, JoinRequest { info: PeerInfo::new(4, "127.0.0.1:1") })
            .await
            .unwrap();
        assert!(response.is_err());
    }

    #[tokio::test]
    async fn test_http_connection_failure() {
        let transport = HttpTransport::new(
            HashMap::from([(2, "127.0.0.1:59999".to_string())]),
            Duration::from_millis(100),
        )
        .unwrap();

        let result = transport.request_vote(2, vote_args()).await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed) | Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_sync_peers_replaces_address_book() {
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(5)).unwrap();
        assert_eq!(transport.request_vote(2, vote_args()).await.unwrap_err(), TransportError::NodeNotFound);

        transport.sync_peers(&[PeerInfo::new(2, "127.0.0.1:59998")]);
        assert_eq!(transport.peer_addr(2).unwrap(), "127.0.0.1:59998");
    }

    #[tokio::test]
    async fn test_http_install_large_snapshot() {
        let source = MemoryStore::new();
        let padding = "x".repeat(8 * 1024);
        let actions: Vec<StoreAction> = (0..512)
            .map(|i| {
                let mut task = Task::new(format!("task-{}", i), "web");
                task.annotations.labels.insert("padding".to_string(), padding.clone());
                StoreAction::Create(Object::Task(task))
            })
            .collect();
        source.apply_actions(10, &actions).unwrap();
        let data = source.snapshot().unwrap();
        assert!(data.len() > 4 * 1024 * 1024);

        let target = MemoryStore::new();
        let addr = serve_store(2, None, target.clone()).await;
        let transport = HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(30)).unwrap();

        let args = InstallSnapshotArgs {
            term: 1,
            leader_id: 1,
            last_included_index: 10,
            last_included_term: 1,
            membership: Membership::single(PeerInfo::new(1, "127.0.0.1:1")),
            data,
        };
        let result = transport.install_snapshot(2, args).await.unwrap();

        assert!(matches!(result, InstallSnapshotResult::Success { term: 1 }), "{:?}", result);
        assert_eq!(target.view(|tx| tx.count(ObjectKind::Task)), 512);
        assert_eq!(target.applied_index(), 10);
    }

    #[tokio::test]
    async fn test_http_rejects_message_over_limit() {
        let core = RaftCore::new(2, Box::new(MemoryStorage::new()), Box::new(MemoryStore::new())).unwrap();
        let router = create_router(RaftService::core_only(Arc::new(Mutex::new(core))), None, 1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let transport = HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(5)).unwrap();

        let args = InstallSnapshotArgs {
            term: 1,
            leader_id: 1,
            last_included_index: 3,
            last_included_term: 1,
            membership: Membership::single(PeerInfo::new(1, "127.0.0.1:1")),
            data: vec![0; 4096],
        };
        let err = transport.install_snapshot(2, args).await.unwrap_err();

        assert!(matches!(err, TransportError::Codec(ref msg) if msg.contains("413")), "{:?}", err);
    }
}
