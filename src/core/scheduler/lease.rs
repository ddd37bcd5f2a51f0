// src/core/scheduler/lease.rs

//! Leases: the accounting token held while a target serves a request.
//! Acquiring increments the target's inflight count; exactly one release
//! happens per lease, on success, error, timeout, or drop.

use crate::core::NodeId;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Load signals for one node, fed by local leases and peer heartbeats.
#[derive(Debug, Default)]
pub struct NodeLoad {
    /// Leases this node has dispatched at the target, not yet released.
    pub inflight: AtomicU32,
    /// The target's own inflight count, from its last heartbeat.
    pub reported_inflight: AtomicU32,
    /// Normalized load from the heartbeat, scaled to 0..=1000.
    pub load_permille: AtomicU32,
    /// Estimated queue wait at the target, milliseconds.
    pub queue_wait_ms: AtomicU32,
    /// Declared concurrency cap; 0 means "not declared".
    pub cap: AtomicU32,
}

impl NodeLoad {
    /// Best estimate of the target's current inflight count.
    pub fn effective_inflight(&self) -> u32 {
        self.inflight
            .load(Ordering::Relaxed)
            .max(self.reported_inflight.load(Ordering::Relaxed))
    }

    /// Load in [0, 1] for scoring.
    pub fn normalized_load(&self) -> f64 {
        let reported = self.load_permille.load(Ordering::Relaxed) as f64 / 1000.0;
        let cap = self.cap.load(Ordering::Relaxed);
        let from_inflight = if cap > 0 {
            self.effective_inflight() as f64 / cap as f64
        } else {
            0.0
        };
        reported.max(from_inflight).clamp(0.0, 1.0)
    }
}

/// The per-node load registry, partitioned by node id.
#[derive(Default)]
pub struct NodeLoads {
    map: DashMap<NodeId, Arc<NodeLoad>>,
}

impl NodeLoads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &NodeId) -> Arc<NodeLoad> {
        self.map.entry(node.clone()).or_default().clone()
    }

    pub fn remove(&self, node: &NodeId) {
        self.map.remove(node);
    }
}

/// RAII lease. Dropping releases exactly once; inflight counts can never go
/// negative because release is guarded.
pub struct LeaseGuard {
    load: Arc<NodeLoad>,
    pub target: NodeId,
    pub acquired_at: Instant,
    released: bool,
}

impl LeaseGuard {
    pub fn acquire(load: Arc<NodeLoad>, target: NodeId) -> Self {
        load.inflight.fetch_add(1, Ordering::SeqCst);
        crate::core::metrics::LEASES_INFLIGHT.inc();
        Self {
            load,
            target,
            acquired_at: Instant::now(),
            released: false,
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.load.inflight.fetch_sub(1, Ordering::SeqCst);
            crate::core::metrics::LEASES_INFLIGHT.dec();
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}
