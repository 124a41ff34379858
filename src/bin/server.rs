//! Consensus store server binary
//!
//! Runs a single node. Peer RPCs and membership requests share one HTTP port.
//!
//! Example for a 3-node cluster:
//!   Node 1: swarm-raft --id 1 --listen 127.0.0.1:8001 --data-dir /tmp/raft1 --bootstrap
//!   Node 2: swarm-raft --id 2 --listen 127.0.0.1:8002 --data-dir /tmp/raft2 --join 127.0.0.1:8001
//!   Node 3: swarm-raft --id 3 --listen 127.0.0.1:8003 --data-dir /tmp/raft3 --join 127.0.0.1:8001
//!
//! A restarted node resumes from its data dir and needs neither flag.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use swarm_raft::core::{PeerInfo, RaftConfig, RaftCore, RaftServer};
use swarm_raft::storage::FileStorage;
use swarm_raft::store::MemoryStore;
use swarm_raft::transport::http::{create_router, HttpTransport};
use swarm_raft::transport::RaftService;

#[derive(Parser, Debug)]
#[command(name = "swarm-raft")]
#[command(about = "Replicated consensus store node")]
struct Args {
    /// Node ID, unique within the cluster
    #[arg(long, env = "SWARM_RAFT_ID")]
    id: u64,

    /// Address to serve peer RPCs on
    #[arg(long, env = "SWARM_RAFT_LISTEN", default_value = "127.0.0.1:8001")]
    listen: SocketAddr,

    /// Address other members use to reach this node (defaults to --listen)
    #[arg(long, env = "SWARM_RAFT_ADVERTISE")]
    advertise: Option<String>,

    /// Directory for the log, hard state and snapshots
    #[arg(long, env = "SWARM_RAFT_DATA_DIR")]
    data_dir: PathBuf,

    /// Found a new single-member cluster
    #[arg(long, conflicts_with = "join")]
    bootstrap: bool,

    /// Join the cluster through this member
    #[arg(long, env = "SWARM_RAFT_JOIN")]
    join: Option<String>,

    /// Shared secret peers present on every request
    #[arg(long, env = "SWARM_RAFT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, default_value_t = 150)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_min_ms: u64,

    #[arg(long, default_value_t = 500)]
    election_max_ms: u64,

    /// Applied entries between snapshots (0 disables)
    #[arg(long, default_value_t = 1000)]
    snapshot_threshold: u64,

    /// Largest peer request accepted, in MiB
    #[arg(long, env = "SWARM_RAFT_MAX_MESSAGE_MB", default_value_t = 64)]
    max_message_mb: usize,
}

impl Args {
    fn raft_config(&self) -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_ms))
            .with_election_timeout(
                Duration::from_millis(self.election_min_ms),
                Duration::from_millis(self.election_max_ms),
            )
            .with_snapshot_threshold(self.snapshot_threshold)
            .with_max_message_bytes(self.max_message_mb.saturating_mul(1024 * 1024))
    }

    fn advertise_addr(&self) -> String {
        self.advertise.clone().unwrap_or_else(|| self.listen.to_string())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "node failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.raft_config();
    let advertise = args.advertise_addr();
    info!(node_id = args.id, listen = %args.listen, advertise = %advertise, data_dir = %args.data_dir.display(), "starting node");

    let storage = FileStorage::new(&args.data_dir)?;
    let store = MemoryStore::new();
    let mut core = RaftCore::new(args.id, Box::new(storage), Box::new(store.clone()))?;
    if args.bootstrap && core.bootstrap(&[PeerInfo::new(args.id, advertise.clone())]) {
        info!(node_id = args.id, "founded new cluster");
    }

    let mut transport = HttpTransport::new(HashMap::new(), config.rpc_timeout)?;
    if let Some(token) = &args.token {
        transport = transport.with_token(token.clone());
    }

    let max_message_bytes = config.max_message_bytes;
    let (server, _) = RaftServer::with_config(core, transport, config);
    let router = create_router(RaftService::new(server.handle()), args.token.clone(), max_message_bytes);
    let handle = server.start();
    store.set_proposer(Arc::new(handle.clone()));

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(node_id = args.id, addr = %args.listen, "serving peer RPCs");
    let http = tokio::spawn(async move { axum::serve(listener, router).await });

    if let Some(seed) = &args.join {
        handle.join_cluster(seed, &advertise).await?;
    }

    tokio::select! {
        result = http => result??,
        _ = tokio::signal::ctrl_c() => {
            info!(node_id = args.id, "shutting down");
            handle.shutdown().await;
        }
    }
    Ok(())
}
