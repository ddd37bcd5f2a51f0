// src/core/scheduler/routes.rs

//! The derived route cache from model id to candidate node ids, rebuilt from state
//! change events and never persisted. Candidates are re-validated against
//! the live state store at selection time, so a stale cache can delay but
//! never violate route validity.

use crate::core::state::types::{NodeRecord, ReplicaStatus};
use crate::core::state::{StateEvent, StateStore, StateTopic};
use crate::core::{ModelId, NodeId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub struct RouteTable {
    store: Arc<StateStore>,
    routes: DashMap<ModelId, Arc<Vec<NodeId>>>,
}

impl RouteTable {
    pub fn new(store: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            routes: DashMap::new(),
        })
    }

    /// Candidate records for a model: cached ids resolved against the
    /// current store view, so every returned node is live with a ready
    /// replica *now*.
    pub fn candidates(&self, model: &ModelId) -> Vec<NodeRecord> {
        let cached = self.routes.get(model).map(|entry| entry.value().clone());
        match cached {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.store.node(id))
                .filter(|node| {
                    node.state == crate::core::state::types::NodeLifecycle::Live
                        && self
                            .store
                            .replica(model, &node.id)
                            .is_some_and(|r| r.status == ReplicaStatus::Ready)
                })
                .collect(),
            None => {
                let fresh = self.store.serving_candidates(model);
                self.routes.insert(
                    model.clone(),
                    Arc::new(fresh.iter().map(|n| n.id.clone()).collect()),
                );
                fresh
            }
        }
    }

    fn rebuild(&self, model: &ModelId) {
        let candidates = self.store.serving_candidates(model);
        debug!("Route for {model} rebuilt with {} candidates", candidates.len());
        self.routes.insert(
            model.clone(),
            Arc::new(candidates.into_iter().map(|n| n.id).collect()),
        );
    }

    fn rebuild_all(&self) {
        self.routes.clear();
        for model in self.store.models() {
            self.rebuild(&model.id);
        }
    }

    /// Rebuilds routes on replica and node change events, in commit order.
    pub async fn run_rebuilder(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut replica_rx = self.store.subscribe(StateTopic::Replica);
        let mut node_rx = self.store.subscribe(StateTopic::Node);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Route rebuilder shutting down.");
                    return;
                }
                Some(event) = replica_rx.recv() => match event {
                    StateEvent::ReplicaUpdated(replica) => self.rebuild(&replica.model),
                    StateEvent::ReplicaRemoved { model, .. } => self.rebuild(&model),
                    StateEvent::Lagged => self.rebuild_all(),
                    _ => {}
                },
                Some(event) = node_rx.recv() => match event {
                    // A node transition can change every route it served.
                    StateEvent::NodeUpdated(_) | StateEvent::NodeRemoved(_) => self.rebuild_all(),
                    StateEvent::Lagged => self.rebuild_all(),
                    _ => {}
                },
            }
        }
    }
}
