// src/server/initialization.rs

//! Builds every component in dependency order (transport, consensus,
//! state, distribution, then scheduler) and binds the listeners. Anything
//! that fails here is fatal: the process exits non-zero.

use super::context::{LogReloadHandle, ServerContext, SharedState};
use crate::config::Config;
use crate::core::distribution::{ChunkStore, DistributionManager, ManifestStore};
use crate::core::engine::EngineClient;
use crate::core::identity::NodeIdentity;
use crate::core::raft::net::TransportRaftNetwork;
use crate::core::raft::{self, LogStore, Proposer};
use crate::core::scheduler::{NodeLoads, RouteTable, Scheduler};
use crate::core::state::{StateStore, proposal_validator};
use crate::core::transport::gossip::GossipService;
use crate::core::transport::{Transport, tls};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all node components before the main loop starts.
pub async fn setup(config: Config, log_reload_handle: LogReloadHandle) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let data_dir = Path::new(&config.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory '{}'", config.data_dir))?;

    let identity = Arc::new(NodeIdentity::load_or_generate(data_dir)?);
    info!("Node identity: {}", identity.id());

    // --- Listeners ---
    let peer_listener = TcpListener::bind((config.network.host.as_str(), config.network.peer_port))
        .await
        .with_context(|| format!("Failed to bind peer listener on {}", config.network.peer_port))?;
    let http_listener = TcpListener::bind((config.network.host.as_str(), config.network.http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.network.http_port))?;
    let gossip_socket =
        UdpSocket::bind((config.network.host.as_str(), config.network.gossip_port))
            .await
            .with_context(|| {
                format!("Failed to bind gossip bus on {}", config.network.gossip_port)
            })?;
    gossip_socket
        .set_broadcast(true)
        .context("Failed to enable broadcast on the gossip socket")?;

    // --- Transport ---
    let tls_acceptor = match &config.tls {
        Some(tls_cfg) => Some(tls::build_acceptor(tls_cfg)?),
        None => {
            warn!("Peer TLS is not configured; streams are authenticated but not encrypted.");
            None
        }
    };
    let my_addrs = vec![config.advertised_peer_addr()];
    let (transport, transport_incoming) = Transport::new(
        identity.clone(),
        config.transport.clone(),
        config.cluster.rendezvous.clone(),
        my_addrs,
        config.advertised_gossip_addr(),
        config.cluster.deny_list.clone(),
        tls_acceptor,
    );

    let stale_window_ms = config.health.heartbeat_interval_ms * 6;
    let gossip = Arc::new(GossipService::new(
        gossip_socket,
        identity.id().clone(),
        config.cluster.rendezvous.clone(),
        transport.peers.clone(),
        config.transport.gossip_event_buffer,
        config.transport.gossip_max_payload,
        stale_window_ms,
    ));

    // --- Consensus and state ---
    let store = Arc::new(StateStore::new(config.state.event_queue_capacity));
    let log_store = LogStore::open(data_dir)?;
    let validator = proposal_validator(store.clone(), identity.id().clone());
    // A node with no bootstrap peers seeds a fresh single-node cluster.
    let bootstrap = config.cluster.bootstrap_peers.is_empty();
    let network = Arc::new(TransportRaftNetwork::new(transport.clone()));
    let (raft, raft_task) = raft::build(
        identity.id().clone(),
        config.raft.clone(),
        log_store,
        network,
        store.clone(),
        Some(validator),
        bootstrap,
        shutdown_tx.subscribe(),
    )?;
    let proposer = Proposer::new(raft.clone(), transport.clone());

    // --- Distribution ---
    let cas = Arc::new(ChunkStore::new(data_dir));
    let manifests = ManifestStore::new(data_dir);
    let engine = Arc::new(EngineClient::new(&config.engine)?);
    let distribution = DistributionManager::new(
        config.distribution.clone(),
        identity.id().clone(),
        config.zone.clone(),
        store.clone(),
        transport.clone(),
        proposer.clone(),
        cas,
        manifests,
        engine.clone(),
        Path::new(&config.engine.models_dir).to_path_buf(),
    );
    match distribution.gc_unreferenced_chunks().await {
        Ok(0) => {}
        Ok(n) => info!("Startup CAS garbage collection removed {n} chunks"),
        Err(e) => warn!("Startup CAS garbage collection failed: {e}"),
    }

    // --- Scheduler ---
    let loads = Arc::new(NodeLoads::new());
    loads
        .get(identity.id())
        .cap
        .store(config.scheduler.default_concurrency_cap, Ordering::Relaxed);
    let routes = RouteTable::new(store.clone());
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        identity.id().clone(),
        transport.clone(),
        engine.clone(),
        distribution.clone(),
        routes,
        loads.clone(),
    );

    if engine.health().await {
        info!("Local inference engine is healthy at {}", engine.base_url());
    } else {
        warn!(
            "Local inference engine at {} is not answering; serving will fail until it does",
            engine.base_url()
        );
    }

    let shared = Arc::new(SharedState {
        config,
        identity,
        transport,
        gossip,
        raft,
        proposer,
        store,
        distribution,
        scheduler,
        loads,
        engine,
        log_reload_handle,
        shutdown_tx,
    });

    Ok(ServerContext {
        shared,
        peer_listener: Some(peer_listener),
        http_listener,
        transport_incoming: Some(transport_incoming),
        raft_task,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config) {
    info!("InferMesh {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "HTTP on {}:{}, peers on {}:{}, gossip on {}:{}",
        config.network.host,
        config.network.http_port,
        config.network.host,
        config.network.peer_port,
        config.network.host,
        config.network.gossip_port
    );
    if config.cluster.bootstrap_peers.is_empty() {
        info!("No bootstrap peers configured; this node seeds a new cluster.");
    } else {
        info!(
            "Bootstrap peers: {}",
            config.cluster.bootstrap_peers.join(", ")
        );
    }
}
