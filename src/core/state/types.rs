// src/core/state/types.rs

//! The typed cluster data model stored in the replicated log. Entities are
//! keyed by stable ids; cross-references are ids resolved through the store
//! on use, never pointers.

use crate::core::{ModelId, NodeId};
use serde::{Deserialize, Serialize};

/// Node lifecycle, driven by the health subsystem.
#[derive(
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum NodeLifecycle {
    #[default]
    Joining,
    Live,
    Draining,
    Suspect,
    Down,
}

impl std::fmt::Display for NodeLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeLifecycle::Joining => "joining",
            NodeLifecycle::Live => "live",
            NodeLifecycle::Draining => "draining",
            NodeLifecycle::Suspect => "suspect",
            NodeLifecycle::Down => "down",
        })
    }
}

#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct GpuInfo {
    pub name: String,
    pub memory_bytes: u64,
}

/// What a node declares about itself when joining and in heartbeats.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, Default, PartialEq, Eq,
)]
pub struct NodeCapabilities {
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub gpus: Vec<GpuInfo>,
    /// Model families this node's engine can serve.
    pub families: Vec<String>,
}

/// A participating process. The node itself owns the volatile fields (load,
/// free memory) and refreshes them via heartbeats; the leader owns
/// lifecycle transitions.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct NodeRecord {
    pub id: NodeId,
    pub addrs: Vec<String>,
    pub gossip_addr: Option<String>,
    pub capabilities: NodeCapabilities,
    pub state: NodeLifecycle,
    pub last_heartbeat_ms: u64,
    pub version: String,
    pub zone: Option<String>,
    /// Maximum concurrent leases this node accepts.
    pub concurrency_cap: u32,
}

/// One slice of a model artifact, content-addressed by its SHA-256 digest.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct ChunkInfo {
    pub index: u32,
    pub offset: u64,
    pub length: u32,
    pub digest: String,
}

/// A file inside the model artifact, expressed as a byte range so receivers
/// can materialize the engine's directory layout without understanding it.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct FileEntry {
    pub path: String,
    pub offset: u64,
    pub length: u64,
}

/// A content-addressed model artifact. Immutable once published.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct ModelRecord {
    pub id: ModelId,
    pub name: String,
    pub version: String,
    pub family: String,
    pub size: u64,
    pub chunks: Vec<ChunkInfo>,
    pub files: Vec<FileEntry>,
    /// Merkle root over the ordered chunk digests.
    pub root_digest: String,
}

#[derive(
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaStatus {
    #[default]
    Pending,
    Transferring,
    Ready,
    Error,
    Deleted,
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ReplicaStatus::Pending => "pending",
            ReplicaStatus::Transferring => "transferring",
            ReplicaStatus::Ready => "ready",
            ReplicaStatus::Error => "error",
            ReplicaStatus::Deleted => "deleted",
        })
    }
}

/// A (model, node) placement record. The set of ready replicas is the
/// authoritative serving set for a model.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct ReplicaRecord {
    pub model: ModelId,
    pub node: NodeId,
    pub status: ReplicaStatus,
    pub bytes_transferred: u64,
    pub last_verified_ms: u64,
    pub error: Option<String>,
    /// Suggested transfer source, set by the reconciler.
    pub source_hint: Option<NodeId>,
}

#[derive(
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategy {
    Random,
    #[default]
    CapabilityAware,
    LocalityAware,
}

impl From<crate::config::PlacementStrategyKind> for PlacementStrategy {
    fn from(kind: crate::config::PlacementStrategyKind) -> Self {
        match kind {
            crate::config::PlacementStrategyKind::Random => PlacementStrategy::Random,
            crate::config::PlacementStrategyKind::CapabilityAware => {
                PlacementStrategy::CapabilityAware
            }
            crate::config::PlacementStrategyKind::LocalityAware => {
                PlacementStrategy::LocalityAware
            }
        }
    }
}

/// Per-model replication policy. `max = 0` means "cluster size".
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct ReplicationPolicy {
    pub model: ModelId,
    pub min: u32,
    pub max: u32,
    pub strategy: PlacementStrategy,
}

impl ReplicationPolicy {
    /// The effective maximum given the current cluster size.
    pub fn effective_max(&self, cluster_size: usize) -> u32 {
        if self.max == 0 {
            cluster_size as u32
        } else {
            self.max.min(cluster_size as u32)
        }
    }
}
