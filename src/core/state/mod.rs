// src/core/state/mod.rs

//! The cluster state store: a typed, subscribable view of the replicated
//! log holding nodes, models, placements, and policies.

pub mod events;
pub mod keys;
pub mod store;
pub mod types;

pub use events::{StateEvent, StateTopic};
pub use store::{StateStore, proposal_validator};
pub use types::{
    ChunkInfo, FileEntry, GpuInfo, ModelRecord, NodeCapabilities, NodeLifecycle, NodeRecord,
    PlacementStrategy, ReplicaRecord, ReplicaStatus, ReplicationPolicy,
};
