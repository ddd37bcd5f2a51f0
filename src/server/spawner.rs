// src/server/spawner.rs

//! Spawns all of the node's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::distribution::{ReconcileTask, TransferServer};
use crate::core::health::{FailureDetector, HeartbeatTask, declare_capabilities, run_health_service};
use crate::core::raft::net::run_raft_service;
use crate::core::raft::LogRecord;
use crate::core::scheduler::proxy::ProxyServer;
use crate::core::state::keys;
use crate::core::state::types::{NodeLifecycle, NodeRecord};
use crate::core::state::{StateEvent, StateTopic};
use crate::core::transport::discovery::{
    BroadcastSource, DiscoverySource, DiscoveryTask, PeerAnnounce, StaticSource,
};
use crate::core::transport::framing::to_wire;
use crate::core::transport::ProtocolId;
use crate::core::now_ms;
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::EnvFilter;

const HANDLER_QUEUE: usize = 64;

/// Spawns every background task into the context's JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let shared = ctx.shared.clone();
    let shutdown_tx = &shared.shutdown_tx;
    let tasks = &mut ctx.background_tasks;

    // --- Transport ---
    let incoming_rx = ctx
        .transport_incoming
        .take()
        .expect("transport incoming receiver consumed twice");
    tasks.spawn(
        shared
            .transport
            .clone()
            .run_dispatcher(incoming_rx, shutdown_tx.subscribe()),
    );
    let peer_listener = ctx
        .peer_listener
        .take()
        .expect("peer listener consumed twice");
    tasks.spawn(
        shared
            .transport
            .clone()
            .run_listener(peer_listener, shutdown_tx.subscribe()),
    );
    tasks.spawn(shared.gossip.clone().run(shutdown_tx.subscribe()));

    // --- Discovery ---
    let announce = PeerAnnounce {
        node_id: shared.node_id().clone(),
        addrs: vec![shared.config.advertised_peer_addr()],
        gossip_addr: shared.config.advertised_gossip_addr(),
    };
    let mut sources: Vec<Box<dyn DiscoverySource>> = vec![Box::new(StaticSource {
        addrs: shared.config.cluster.bootstrap_peers.clone(),
    })];
    if shared.config.cluster.discovery == crate::config::DiscoveryKind::Broadcast {
        sources.push(Box::new(BroadcastSource::new(
            shared.gossip.clone(),
            announce.clone(),
            shared.config.network.gossip_port,
        )));
    }
    let discovery = DiscoveryTask::new(
        shared.transport.clone(),
        shared.gossip.clone(),
        sources,
        announce,
        shared.config.cluster.discovery_interval_ms,
        shared.config.cluster.discovery_connect_cap,
    );
    tasks.spawn(discovery.run(shutdown_tx.subscribe()));

    // --- Stream protocol services ---
    let raft_rx = shared
        .transport
        .register_handler(ProtocolId::Raft, HANDLER_QUEUE);
    tasks.spawn(run_raft_service(
        shared.raft.clone(),
        raft_rx,
        shutdown_tx.subscribe(),
    ));

    let transfer_rx = shared
        .transport
        .register_handler(ProtocolId::ChunkTransfer, HANDLER_QUEUE);
    let transfer_server = std::sync::Arc::new(TransferServer::new(
        shared.node_id().clone(),
        shared.store.clone(),
        shared.distribution.cas.clone(),
        shared.config.distribution.max_outbound_transfers,
        shared.config.distribution.transfer_parallelism,
    ));
    tasks.spawn(transfer_server.run(transfer_rx, shutdown_tx.subscribe()));

    let proxy_rx = shared
        .transport
        .register_handler(ProtocolId::SchedulerProxy, HANDLER_QUEUE);
    let proxy_server = ProxyServer::new(
        shared.node_id().clone(),
        shared.engine.clone(),
        shared.store.clone(),
        shared.loads.clone(),
    );
    tasks.spawn(proxy_server.run(proxy_rx, shutdown_tx.subscribe()));

    let health_rx = shared
        .transport
        .register_handler(ProtocolId::Health, HANDLER_QUEUE);
    tasks.spawn(run_health_service(health_rx, shutdown_tx.subscribe()));

    // --- Scheduler and distribution ---
    tasks.spawn(
        shared
            .scheduler
            .routes
            .clone()
            .run_rebuilder(shutdown_tx.subscribe()),
    );
    tasks.spawn(
        shared
            .distribution
            .clone()
            .run_watcher(shutdown_tx.subscribe()),
    );
    let reconcile = ReconcileTask::new(
        shared.config.distribution.clone(),
        shared.store.clone(),
        shared.distribution.clone(),
        shared.raft.clone(),
    );
    tasks.spawn(reconcile.run(shutdown_tx.subscribe()));

    // --- Health ---
    let heartbeat = HeartbeatTask::new(
        shared.config.health.clone(),
        shared.node_id().clone(),
        shared.gossip.clone(),
        shared.loads.clone(),
        shared.store.clone(),
        shared.proposer.clone(),
        shared.distribution.clone(),
    );
    tasks.spawn(heartbeat.run(shutdown_tx.subscribe()));

    let detector = FailureDetector::new(
        shared.config.health.clone(),
        shared.node_id().clone(),
        shared.store.clone(),
        shared.proposer.clone(),
        shared.raft.clone(),
        shared.transport.clone(),
        shared.gossip.clone(),
        shared.loads.clone(),
    );
    tasks.spawn(detector.run(shutdown_tx.subscribe()));

    // --- Housekeeping tasks ---
    tasks.spawn(register_self(ctx.shared.clone()));
    tasks.spawn(sync_peer_addresses(
        ctx.shared.clone(),
        shutdown_tx.subscribe(),
    ));
    tasks.spawn(apply_replicated_config(
        ctx.shared.clone(),
        shutdown_tx.subscribe(),
    ));

    // --- Metrics ---
    if shared.config.metrics.enabled {
        tasks.spawn(metrics_server::run_metrics_server(
            ctx.shared.clone(),
            shutdown_tx.subscribe(),
        ));
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    Ok(())
}

/// Writes this node's record into the replicated log once a leader exists,
/// then lets the health subsystem drive its lifecycle.
async fn register_self(shared: std::sync::Arc<super::context::SharedState>) {
    let mut status_rx = shared.raft.watch_status();
    loop {
        if status_rx.borrow().leader.is_some() {
            break;
        }
        if status_rx.changed().await.is_err() {
            return;
        }
    }

    let record = NodeRecord {
        id: shared.node_id().clone(),
        addrs: vec![shared.config.advertised_peer_addr()],
        gossip_addr: Some(shared.config.advertised_gossip_addr()),
        capabilities: declare_capabilities(),
        state: NodeLifecycle::Joining,
        last_heartbeat_ms: now_ms(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        zone: shared.config.zone.clone(),
        concurrency_cap: shared.config.scheduler.default_concurrency_cap,
    };
    let Ok(value) = to_wire(&record) else {
        warn!("Cannot encode own node record");
        return;
    };
    loop {
        match shared
            .proposer
            .propose(LogRecord::Put {
                key: keys::node_key(shared.node_id()),
                value: value.clone(),
            })
            .await
        {
            Ok(_) => {
                info!("Registered in the cluster as {}", shared.node_id());
                return;
            }
            Err(e) => {
                debug!("Self-registration deferred: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Keeps the transport's address book in sync with replicated node records
/// so any node can dial any other.
async fn sync_peer_addresses(
    shared: std::sync::Arc<super::context::SharedState>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut node_rx = shared.store.subscribe(StateTopic::Node);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            Some(event) = node_rx.recv() => match event {
                StateEvent::NodeUpdated(record) => {
                    shared
                        .transport
                        .upsert_peer(&record.id, record.addrs.clone(), record.gossip_addr.clone());
                }
                StateEvent::Lagged => {
                    for record in shared.store.nodes() {
                        shared
                            .transport
                            .upsert_peer(&record.id, record.addrs.clone(), record.gossip_addr.clone());
                    }
                }
                _ => {}
            },
        }
    }
}

/// Applies replicated `cfg/` records locally; currently the cluster-wide
/// log level.
async fn apply_replicated_config(
    shared: std::sync::Arc<super::context::SharedState>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut cfg_rx = shared.store.subscribe(StateTopic::Config);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            Some(event) = cfg_rx.recv() => {
                if let StateEvent::ConfigUpdated { key, value } = event {
                    if key == "log_level" {
                        let Ok(level) = String::from_utf8(value) else { continue };
                        match EnvFilter::try_new(&level) {
                            Ok(filter) => {
                                if let Err(e) = shared.log_reload_handle.reload(filter) {
                                    warn!("Failed to apply propagated log level: {e}");
                                } else {
                                    info!("Log level set to '{level}' cluster-wide");
                                }
                            }
                            Err(e) => warn!("Propagated log level '{level}' is invalid: {e}"),
                        }
                    }
                }
            }
        }
    }
}
