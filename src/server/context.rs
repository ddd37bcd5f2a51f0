// src/server/context.rs

//! The shared handle set passed to HTTP handlers and background tasks, and
//! the container for everything initialization produces.

use crate::config::Config;
use crate::core::distribution::DistributionManager;
use crate::core::identity::NodeIdentity;
use crate::core::raft::{Proposer, Raft};
use crate::core::scheduler::{NodeLoads, Scheduler};
use crate::core::state::StateStore;
use crate::core::transport::gossip::GossipService;
use crate::core::transport::{Incoming, Transport};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing_subscriber::{filter::EnvFilter, reload};

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Shared, immutable-after-boot handles. One `Arc<SharedState>` reaches
/// every HTTP handler and background task.
pub struct SharedState {
    pub config: Config,
    pub identity: Arc<NodeIdentity>,
    pub transport: Arc<Transport>,
    pub gossip: Arc<GossipService>,
    pub raft: Raft,
    pub proposer: Proposer,
    pub store: Arc<StateStore>,
    pub distribution: Arc<DistributionManager>,
    pub scheduler: Arc<Scheduler>,
    pub loads: Arc<NodeLoads>,
    pub engine: Arc<crate::core::engine::EngineClient>,
    pub log_reload_handle: LogReloadHandle,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl SharedState {
    pub fn node_id(&self) -> &crate::core::NodeId {
        self.identity.id()
    }
}

/// Everything `initialization::setup` builds, consumed by the spawner and
/// the main loop.
pub struct ServerContext {
    pub shared: Arc<SharedState>,
    pub peer_listener: Option<TcpListener>,
    pub http_listener: TcpListener,
    /// Streams opened by peers, drained by the transport dispatcher.
    pub transport_incoming: Option<mpsc::Receiver<Incoming>>,
    pub raft_task: JoinHandle<()>,
    pub background_tasks: JoinSet<()>,
}
