// src/core/transport/discovery.rs

//! Periodic peer discovery. Each cycle queries every configured source,
//! dials previously-unknown peers up to a cap, and announces this node on
//! the gossip bus. A rendezvous mismatch fails the handshake, so discovery
//! can never mesh two different clusters.

use crate::core::transport::Transport;
use crate::core::transport::framing::{from_wire, to_wire};
use crate::core::transport::gossip::{GossipService, GossipTopic};
use crate::core::{MeshError, NodeId};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// A message announcing a node's reachable addresses, carried on the
/// `PeerAnnounce` gossip topic and on local broadcast probes.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct PeerAnnounce {
    pub node_id: String,
    pub addrs: Vec<String>,
    pub gossip_addr: String,
}

/// A pluggable origin of candidate peer addresses.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn collect(&self) -> Vec<String>;
}

/// The static bootstrap list from configuration.
pub struct StaticSource {
    pub addrs: Vec<String>,
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn collect(&self) -> Vec<String> {
        self.addrs.clone()
    }
}

/// Local broadcast probing: each cycle sends a signed announce datagram to
/// the broadcast address; peers on the same segment answer with their own
/// announces, which arrive through the gossip subscription.
pub struct BroadcastSource {
    gossip: Arc<GossipService>,
    announce: PeerAnnounce,
    broadcast_addr: SocketAddr,
}

impl BroadcastSource {
    pub fn new(gossip: Arc<GossipService>, announce: PeerAnnounce, gossip_port: u16) -> Self {
        Self {
            gossip,
            announce,
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], gossip_port)),
        }
    }
}

#[async_trait]
impl DiscoverySource for BroadcastSource {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn collect(&self) -> Vec<String> {
        match to_wire(&self.announce) {
            Ok(payload) => {
                if let Err(e) = self
                    .gossip
                    .send_to(self.broadcast_addr, GossipTopic::PeerAnnounce, payload)
                    .await
                {
                    debug!("Broadcast probe failed: {e}");
                }
            }
            Err(e) => warn!("Failed to encode broadcast announce: {e}"),
        }
        // Answers flow back via the PeerAnnounce subscription; the probe
        // itself yields no addresses.
        Vec::new()
    }
}

/// The discovery cycle task.
pub struct DiscoveryTask {
    transport: Arc<Transport>,
    gossip: Arc<GossipService>,
    sources: Vec<Box<dyn DiscoverySource>>,
    announce_rx: mpsc::Receiver<crate::core::transport::gossip::GossipInbound>,
    my_announce: PeerAnnounce,
    interval: Duration,
    connect_cap: usize,
}

impl DiscoveryTask {
    pub fn new(
        transport: Arc<Transport>,
        gossip: Arc<GossipService>,
        sources: Vec<Box<dyn DiscoverySource>>,
        my_announce: PeerAnnounce,
        interval_ms: u64,
        connect_cap: usize,
    ) -> Self {
        let announce_rx = gossip.subscribe(GossipTopic::PeerAnnounce);
        Self {
            transport,
            gossip,
            sources,
            announce_rx,
            my_announce,
            interval: Duration::from_millis(interval_ms),
            connect_cap,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Discovery task shutting down.");
                    return;
                }
                _ = tick.tick() => {
                    self.cycle().await;
                }
                Some(inbound) = self.announce_rx.recv() => {
                    self.handle_announce(&inbound.from, &inbound.payload);
                }
            }
        }
    }

    fn handle_announce(&self, from: &NodeId, payload: &[u8]) {
        match from_wire::<PeerAnnounce>(payload) {
            Ok(announce) => {
                if announce.node_id != *from {
                    warn!(
                        "Announce from {} claims identity {}; ignoring",
                        from, announce.node_id
                    );
                    return;
                }
                self.transport
                    .upsert_peer(from, announce.addrs, Some(announce.gossip_addr));
            }
            Err(e) => debug!("Undecodable peer announce from {from}: {e}"),
        }
    }

    async fn cycle(&self) {
        // Re-announce ourselves so late joiners learn our addresses.
        if let Ok(payload) = to_wire(&self.my_announce) {
            let _ = self
                .gossip
                .publish(GossipTopic::PeerAnnounce, payload)
                .await;
        }

        let mut dialed = 0usize;
        for source in &self.sources {
            for addr in source.collect().await {
                if dialed >= self.connect_cap {
                    return;
                }
                if self.transport.knows_addr(&addr) {
                    continue;
                }
                match self.transport.connect_addr(&addr).await {
                    Ok(session) => {
                        info!(
                            "Discovered peer {} at {} via {} source",
                            session.peer_id,
                            addr,
                            source.name()
                        );
                        dialed += 1;
                    }
                    Err(MeshError::AuthFailed(detail)) => {
                        warn!("Peer at {addr} failed authentication: {detail}");
                    }
                    Err(e) => {
                        debug!("Discovery dial to {addr} failed: {e}");
                    }
                }
            }
        }
    }
}
