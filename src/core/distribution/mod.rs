// src/core/distribution/mod.rs

//! Model distribution: content-addressed storage, chunked peer-to-peer
//! transfer, placement planning, and the leader's reconcile loop.

pub mod cas;
pub mod manager;
pub mod manifest;
pub mod placement;
pub mod reconcile;
pub mod transfer;

pub use cas::ChunkStore;
pub use manager::DistributionManager;
pub use manifest::ManifestStore;
pub use reconcile::ReconcileTask;
pub use transfer::{TransferFrame, TransferServer};
