// src/core/health/heartbeat.rs

//! Publishes this node's heartbeat over gossip and periodically refreshes
//! the volatile fields of its own node record in the replicated store.

use crate::config::HealthConfig;
use crate::core::distribution::DistributionManager;
use crate::core::raft::{LogRecord, Proposer};
use crate::core::scheduler::NodeLoads;
use crate::core::state::keys;
use crate::core::state::{StateStore, types::NodeLifecycle};
use crate::core::transport::framing::to_wire;
use crate::core::transport::gossip::{GossipService, GossipTopic};
use crate::core::{NodeId, now_ms};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Heartbeat wire format. Fields are stable across minor versions; `proto`
/// gates additions.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct Heartbeat {
    pub proto: u16,
    pub node: String,
    pub inflight: u32,
    pub load_permille: u32,
    pub queue_wait_ms: u32,
    pub free_memory_bytes: u64,
    pub models_digest: String,
    pub version: String,
    pub timestamp_ms: u64,
}

pub const HEARTBEAT_PROTO: u16 = 1;

/// How many heartbeats pass between refreshes of the node record's
/// volatile fields in the replicated log.
const RECORD_REFRESH_BEATS: u64 = 6;

pub struct HeartbeatTask {
    cfg: HealthConfig,
    node_id: NodeId,
    gossip: Arc<GossipService>,
    loads: Arc<NodeLoads>,
    store: Arc<StateStore>,
    proposer: Proposer,
    distribution: Arc<DistributionManager>,
}

impl HeartbeatTask {
    pub fn new(
        cfg: HealthConfig,
        node_id: NodeId,
        gossip: Arc<GossipService>,
        loads: Arc<NodeLoads>,
        store: Arc<StateStore>,
        proposer: Proposer,
        distribution: Arc<DistributionManager>,
    ) -> Self {
        Self {
            cfg,
            node_id,
            gossip,
            loads,
            store,
            proposer,
            distribution,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.cfg.heartbeat_interval_ms));
        let mut sys = System::new();
        let mut beats: u64 = 0;
        info!(
            "Heartbeat publisher started, interval {}ms",
            self.cfg.heartbeat_interval_ms
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat publisher shutting down.");
                    return;
                }
                _ = tick.tick() => {
                    beats += 1;
                    self.beat(&mut sys, beats).await;
                }
            }
        }
    }

    async fn beat(&self, sys: &mut System, beats: u64) {
        sys.refresh_memory();
        let free_memory = sys.available_memory();

        let load = self.loads.get(&self.node_id);
        let inflight = load.inflight.load(Ordering::Relaxed);
        let cap = load.cap.load(Ordering::Relaxed);
        let load_permille = if cap > 0 {
            ((inflight as u64 * 1000) / cap as u64).min(1000) as u32
        } else {
            0
        };

        let heartbeat = Heartbeat {
            proto: HEARTBEAT_PROTO,
            node: self.node_id.clone(),
            inflight,
            load_permille,
            queue_wait_ms: load.queue_wait_ms.load(Ordering::Relaxed),
            free_memory_bytes: free_memory,
            models_digest: self.distribution.models_digest(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp_ms: now_ms(),
        };

        match to_wire(&heartbeat) {
            Ok(payload) => {
                if let Err(e) = self.gossip.publish(GossipTopic::Heartbeat, payload).await {
                    debug!("Heartbeat publish failed: {e}");
                }
            }
            Err(e) => warn!("Heartbeat encode failed: {e}"),
        }

        // The node owns its record's volatile fields; refresh them in the
        // log at a lower cadence than the gossip heartbeat.
        if beats % RECORD_REFRESH_BEATS == 0 {
            if let Some(mut record) = self.store.node(&self.node_id) {
                if matches!(
                    record.state,
                    NodeLifecycle::Live | NodeLifecycle::Draining
                ) {
                    record.capabilities.free_memory_bytes = free_memory;
                    record.last_heartbeat_ms = now_ms();
                    match to_wire(&record) {
                        Ok(value) => {
                            if let Err(e) = self
                                .proposer
                                .propose(LogRecord::Put {
                                    key: keys::node_key(&self.node_id),
                                    value,
                                })
                                .await
                            {
                                debug!("Node record refresh failed: {e}");
                            }
                        }
                        Err(e) => warn!("Node record encode failed: {e}"),
                    }
                }
            }
        }
    }
}
