// src/core/metrics.rs

//! Defines and registers Prometheus metrics for cluster monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, IntGauge, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram, register_int_gauge,
};

lazy_static! {
    // --- Scheduler ---
    /// Total inference requests accepted by this node's facade.
    pub static ref REQUESTS_TOTAL: CounterVec =
        register_counter_vec!("infermesh_requests_total", "Total inference requests, labeled by outcome.", &["outcome"]).unwrap();
    /// Requests currently holding a lease dispatched from this node.
    pub static ref LEASES_INFLIGHT: IntGauge =
        register_int_gauge!("infermesh_leases_inflight", "Requests currently holding a dispatch lease.").unwrap();
    /// Requests rejected by the per-principal token bucket.
    pub static ref RATE_LIMITED_TOTAL: Counter =
        register_counter!("infermesh_rate_limited_total", "Requests rejected by the rate limiter.").unwrap();
    /// Open circuit breakers across all (node, model) pairs.
    pub static ref BREAKERS_OPEN: IntGauge =
        register_int_gauge!("infermesh_breakers_open", "Number of currently open circuit breakers.").unwrap();
    /// End-to-end latency of admitted requests.
    pub static ref REQUEST_LATENCY_SECONDS: Histogram =
        register_histogram!("infermesh_request_latency_seconds", "Latency of admitted inference requests in seconds.").unwrap();

    // --- Consensus ---
    /// Current Raft term observed by this node.
    pub static ref RAFT_TERM: IntGauge =
        register_int_gauge!("infermesh_raft_term", "Current Raft term.").unwrap();
    /// Last log index committed cluster-wide, as observed locally.
    pub static ref RAFT_COMMIT_INDEX: IntGauge =
        register_int_gauge!("infermesh_raft_commit_index", "Last committed Raft log index.").unwrap();
    /// 1 when this node is the leader.
    pub static ref RAFT_IS_LEADER: Gauge =
        register_gauge!("infermesh_raft_is_leader", "Whether this node is the Raft leader (1 or 0).").unwrap();
    /// Proposals committed through this node.
    pub static ref RAFT_PROPOSALS_TOTAL: CounterVec =
        register_counter_vec!("infermesh_raft_proposals_total", "Raft proposals, labeled by outcome.", &["outcome"]).unwrap();

    // --- Distribution ---
    /// Chunk bytes received by transfers on this node.
    pub static ref TRANSFER_BYTES_IN: Counter =
        register_counter!("infermesh_transfer_bytes_in_total", "Total chunk bytes received.").unwrap();
    /// Chunk bytes served to other nodes.
    pub static ref TRANSFER_BYTES_OUT: Counter =
        register_counter!("infermesh_transfer_bytes_out_total", "Total chunk bytes sent.").unwrap();
    /// Transfers currently running with this node as the receiver.
    pub static ref TRANSFERS_ACTIVE: IntGauge =
        register_int_gauge!("infermesh_transfers_active", "Inbound transfers currently running.").unwrap();
    /// Chunk or root digest mismatches detected.
    pub static ref INTEGRITY_FAILURES_TOTAL: Counter =
        register_counter!("infermesh_integrity_failures_total", "Digest mismatches detected during transfer or verify.").unwrap();

    // --- Cluster ---
    /// Live nodes in the local state store view.
    pub static ref CLUSTER_LIVE_NODES: IntGauge =
        register_int_gauge!("infermesh_cluster_live_nodes", "Nodes in the live state.").unwrap();
    /// Gossip datagrams dropped for failed signature checks.
    pub static ref GOSSIP_REJECTED_TOTAL: Counter =
        register_counter!("infermesh_gossip_rejected_total", "Gossip messages rejected (bad signature or stale).").unwrap();
    /// Peer sessions currently pooled.
    pub static ref PEER_SESSIONS: IntGauge =
        register_int_gauge!("infermesh_peer_sessions", "Pooled peer sessions.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text
/// format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
