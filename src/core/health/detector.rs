// src/core/health/detector.rs

//! Failure detection and node lifecycle orchestration. Every node tracks
//! when it last heard each peer; silence past the suspect threshold is
//! reported over gossip, and the leader turns confirmed or prolonged
//! silence into a down transition through the log. Returning nodes rejoin
//! as joining and are verified before becoming live again.

use crate::config::HealthConfig;
use crate::core::health::{HealthMsg, declare_capabilities};
use crate::core::health::heartbeat::Heartbeat;
use crate::core::raft::{LogRecord, MembershipOp, Proposer, Raft};
use crate::core::scheduler::NodeLoads;
use crate::core::state::keys;
use crate::core::state::types::{NodeLifecycle, NodeRecord};
use crate::core::state::{StateEvent, StateStore, StateTopic};
use crate::core::transport::framing::{from_wire, to_wire};
use crate::core::transport::gossip::{GossipInbound, GossipService, GossipTopic};
use crate::core::transport::{ProtocolId, Transport};
use crate::core::{MeshError, NodeId, now_ms};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Gossip payload naming a peer this node can no longer hear.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct SuspectReport {
    pub suspect: String,
    pub reporter: String,
    pub timestamp_ms: u64,
}

/// Down nodes are forgotten (record and vote removed) after this many
/// heartbeat intervals.
const FORGET_MULTIPLIER: u32 = 120;

pub struct FailureDetector {
    cfg: HealthConfig,
    node_id: NodeId,
    store: Arc<StateStore>,
    proposer: Proposer,
    raft: Raft,
    transport: Arc<Transport>,
    gossip: Arc<GossipService>,
    loads: Arc<NodeLoads>,
    last_heard: DashMap<NodeId, Instant>,
    locally_suspect: DashMap<NodeId, Instant>,
    /// Peers that confirmed a suspicion, per suspect. Leader-side only.
    confirmations: DashMap<NodeId, HashSet<NodeId>>,
    down_since: DashMap<NodeId, Instant>,
    rejoining: DashMap<NodeId, ()>,
}

impl FailureDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: HealthConfig,
        node_id: NodeId,
        store: Arc<StateStore>,
        proposer: Proposer,
        raft: Raft,
        transport: Arc<Transport>,
        gossip: Arc<GossipService>,
        loads: Arc<NodeLoads>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            node_id,
            store,
            proposer,
            raft,
            transport,
            gossip,
            loads,
            last_heard: DashMap::new(),
            locally_suspect: DashMap::new(),
            confirmations: DashMap::new(),
            down_since: DashMap::new(),
            rejoining: DashMap::new(),
        })
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cfg.heartbeat_interval_ms)
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut hb_rx = self.gossip.subscribe(GossipTopic::Heartbeat);
        let mut suspect_rx = self.gossip.subscribe(GossipTopic::SuspectReport);
        let mut node_rx = self.store.subscribe(StateTopic::Node);
        let mut tick = tokio::time::interval(self.heartbeat_interval());
        info!("Failure detector started.");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Failure detector shutting down.");
                    return;
                }
                Some(inbound) = hb_rx.recv() => self.handle_heartbeat(inbound).await,
                Some(inbound) = suspect_rx.recv() => self.handle_suspect_report(inbound).await,
                Some(event) = node_rx.recv() => self.handle_node_event(event).await,
                _ = tick.tick() => self.sweep().await,
            }
        }
    }

    async fn handle_heartbeat(self: &Arc<Self>, inbound: GossipInbound) {
        let heartbeat: Heartbeat = match from_wire(&inbound.payload) {
            Ok(hb) => hb,
            Err(e) => {
                debug!("Undecodable heartbeat from {}: {e}", inbound.from);
                return;
            }
        };
        if heartbeat.node != inbound.from {
            warn!(
                "Heartbeat from {} claims node {}; ignoring",
                inbound.from, heartbeat.node
            );
            return;
        }
        let peer = heartbeat.node.clone();
        self.last_heard.insert(peer.clone(), Instant::now());
        if self.locally_suspect.remove(&peer).is_some() {
            info!("Node {peer} is heard again; clearing local suspicion");
        }
        self.confirmations.remove(&peer);

        // Feed the scheduler's load signals.
        let load = self.loads.get(&peer);
        load.reported_inflight
            .store(heartbeat.inflight, Ordering::Relaxed);
        load.load_permille
            .store(heartbeat.load_permille, Ordering::Relaxed);
        load.queue_wait_ms
            .store(heartbeat.queue_wait_ms, Ordering::Relaxed);

        // A heartbeat from a node the log says is down starts the rejoin
        // protocol; one from a suspect node clears the suspicion (leader
        // only).
        if self.raft.is_leader() {
            if let Some(record) = self.store.node(&peer) {
                match record.state {
                    NodeLifecycle::Down => self.start_rejoin(record).await,
                    NodeLifecycle::Suspect => {
                        self.propose_transition(&record, NodeLifecycle::Live).await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn handle_suspect_report(&self, inbound: GossipInbound) {
        let report: SuspectReport = match from_wire(&inbound.payload) {
            Ok(r) => r,
            Err(e) => {
                debug!("Undecodable suspect report from {}: {e}", inbound.from);
                return;
            }
        };
        if report.reporter != inbound.from || report.suspect == self.node_id {
            return;
        }
        self.confirmations
            .entry(report.suspect.clone())
            .or_default()
            .insert(report.reporter);
        debug!("Recorded suspicion of {} from {}", report.suspect, inbound.from);
    }

    async fn handle_node_event(self: &Arc<Self>, event: StateEvent) {
        let StateEvent::NodeUpdated(record) = event else {
            return;
        };
        match record.state {
            NodeLifecycle::Down => {
                self.down_since
                    .entry(record.id.clone())
                    .or_insert_with(Instant::now);
                self.loads.remove(&record.id);
            }
            NodeLifecycle::Joining if self.raft.is_leader() => {
                if record.id == self.node_id {
                    // No probe needed for ourselves.
                    let mut updated = record.clone();
                    updated.state = NodeLifecycle::Live;
                    self.propose_transition(&updated, NodeLifecycle::Live).await;
                } else {
                    self.verify_joining(record).await;
                }
            }
            NodeLifecycle::Live => {
                self.down_since.remove(&record.id);
                // Live nodes vote. Membership changes are single-server and
                // serialized; failures here retry on the next sweep.
                if self.raft.is_leader()
                    && !self.raft.status().membership.voters.contains(&record.id)
                {
                    if let Err(e) = self
                        .raft
                        .change_membership(MembershipOp::AddVoter(record.id.clone()))
                        .await
                    {
                        debug!("AddVoter for {} deferred: {e}", record.id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Periodic sweep: suspicion, down transitions, and forgetting nodes
    /// that stayed down past the grace period.
    async fn sweep(self: &Arc<Self>) {
        let suspect_after = self.heartbeat_interval() * self.cfg.suspect_multiplier;
        let down_after = self.heartbeat_interval() * self.cfg.down_multiplier;
        let is_leader = self.raft.is_leader();

        for record in self.store.nodes() {
            if record.id == self.node_id {
                continue;
            }
            if record.state == NodeLifecycle::Down {
                continue;
            }
            // A node never heard from starts its silence clock now rather
            // than being condemned on the detector's first sweep.
            let silence = match self.last_heard.get(&record.id) {
                Some(heard) => heard.elapsed(),
                None => {
                    self.last_heard.insert(record.id.clone(), Instant::now());
                    continue;
                }
            };

            if silence > suspect_after && !self.locally_suspect.contains_key(&record.id) {
                info!(
                    "Node {} unheard for {:?}; marking suspect locally",
                    record.id, silence
                );
                self.locally_suspect.insert(record.id.clone(), Instant::now());
                let report = SuspectReport {
                    suspect: record.id.clone(),
                    reporter: self.node_id.clone(),
                    timestamp_ms: now_ms(),
                };
                if let Ok(payload) = to_wire(&report) {
                    let _ = self
                        .gossip
                        .publish(GossipTopic::SuspectReport, payload)
                        .await;
                }
                // The leader records its own suspicion in the log so routes
                // stop selecting the node immediately.
                if is_leader && record.state != NodeLifecycle::Joining {
                    self.propose_transition(&record, NodeLifecycle::Suspect).await;
                }
            }

            if is_leader && self.locally_suspect.contains_key(&record.id) {
                let confirmed = self
                    .confirmations
                    .get(&record.id)
                    .map(|c| !c.is_empty())
                    .unwrap_or(false);
                // One independent witness, or continued silence past the
                // longer threshold, lets the leader act alone.
                if confirmed || silence > down_after {
                    self.propose_transition(&record, NodeLifecycle::Down).await;
                }
            }
        }

        if is_leader {
            self.forget_expired().await;
        }

        crate::core::metrics::CLUSTER_LIVE_NODES.set(self.store.live_nodes().len() as i64);
    }

    async fn forget_expired(&self) {
        let forget_after = self.heartbeat_interval() * FORGET_MULTIPLIER;
        let expired: Vec<NodeId> = self
            .down_since
            .iter()
            .filter(|entry| entry.value().elapsed() > forget_after)
            .map(|entry| entry.key().clone())
            .collect();
        for node in expired {
            info!("Forgetting node {node} after its down grace period");
            if let Err(e) = self
                .raft
                .change_membership(MembershipOp::RemoveVoter(node.clone()))
                .await
            {
                debug!("RemoveVoter for {node} deferred: {e}");
                continue;
            }
            let _ = self
                .proposer
                .propose(LogRecord::Delete {
                    key: keys::node_key(&node),
                })
                .await;
            self.down_since.remove(&node);
            self.last_heard.remove(&node);
            self.locally_suspect.remove(&node);
            self.confirmations.remove(&node);
        }
    }

    async fn propose_transition(&self, record: &NodeRecord, state: NodeLifecycle) {
        let mut updated = record.clone();
        updated.state = state;
        match to_wire(&updated) {
            Ok(value) => {
                info!("Proposing {} -> {state}", record.id);
                if let Err(e) = self
                    .proposer
                    .propose(LogRecord::Put {
                        key: keys::node_key(&record.id),
                        value,
                    })
                    .await
                {
                    warn!("Lifecycle transition for {} failed: {e}", record.id);
                }
            }
            Err(e) => warn!("Node record encode failed: {e}"),
        }
    }

    /// A down node came back with a matching identity: it rejoins as
    /// joining and is verified before becoming live.
    async fn start_rejoin(self: &Arc<Self>, record: NodeRecord) {
        if self.rejoining.insert(record.id.clone(), ()).is_some() {
            return;
        }
        info!("Node {} returned; rejoining as joining", record.id);
        self.propose_transition(&record, NodeLifecycle::Joining).await;
        // Verification continues from the Joining event.
    }

    /// Probes a joining node, re-declares its capabilities, and promotes it
    /// to live. Probe failures leave it joining for the next attempt.
    async fn verify_joining(self: &Arc<Self>, record: NodeRecord) {
        let detector = self.clone();
        tokio::spawn(async move {
            let result = detector.probe_and_promote(&record).await;
            detector.rejoining.remove(&record.id);
            if let Err(e) = result {
                warn!("Verification of joining node {} failed: {e}", record.id);
            }
        });
    }

    async fn probe_and_promote(&self, record: &NodeRecord) -> Result<(), MeshError> {
        let probe = tokio::time::timeout(
            Duration::from_millis(self.cfg.rejoin_probe_timeout_ms),
            self.transport
                .send::<HealthMsg, HealthMsg>(&record.id, ProtocolId::Health, &HealthMsg::Probe),
        )
        .await
        .map_err(|_| MeshError::Timeout(format!("health probe to {}", record.id)))??;

        let HealthMsg::Pong {
            version,
            capabilities,
        } = probe
        else {
            return Err(MeshError::Codec("expected Pong".to_string()));
        };
        if version != env!("CARGO_PKG_VERSION") {
            warn!(
                "Node {} runs version {version}, leader runs {}",
                record.id,
                env!("CARGO_PKG_VERSION")
            );
        }

        let mut updated = record.clone();
        updated.state = NodeLifecycle::Live;
        updated.capabilities = capabilities;
        updated.version = version;
        updated.last_heartbeat_ms = now_ms();
        self.proposer
            .propose(LogRecord::Put {
                key: keys::node_key(&record.id),
                value: to_wire(&updated)?,
            })
            .await?;
        info!("Node {} verified and live", record.id);
        Ok(())
    }
}

/// Serves directed health probes: any peer may ask for a liveness pong
/// with our current capability declaration.
pub async fn run_health_service(
    mut incoming_rx: tokio::sync::mpsc::Receiver<crate::core::transport::Incoming>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Health probe service shutting down.");
                return;
            }
            maybe = incoming_rx.recv() => {
                let Some(incoming) = maybe else { return };
                tokio::spawn(async move {
                    let mut stream = incoming.stream;
                    while let Ok(msg) = stream.recv_msg::<HealthMsg>().await {
                        match msg {
                            HealthMsg::Probe => {
                                let pong = HealthMsg::Pong {
                                    version: env!("CARGO_PKG_VERSION").to_string(),
                                    capabilities: declare_capabilities(),
                                };
                                if stream.send_msg(&pong).await.is_err() {
                                    break;
                                }
                            }
                            HealthMsg::Pong { .. } => break,
                        }
                    }
                });
            }
        }
    }
}
