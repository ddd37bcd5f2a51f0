// src/core/distribution/placement.rs

//! Placement planning: which nodes should receive or lose replicas. All
//! strategies except `random` are deterministic given the same state, with
//! the tie-break order (meets-capability desc, free-memory desc,
//! current-model-count asc, node-id asc).

use crate::core::state::types::{
    ModelRecord, NodeLifecycle, NodeRecord, PlacementStrategy, ReplicaRecord, ReplicaStatus,
};
use crate::core::NodeId;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};

/// Whether a node can hold and serve the model at all.
pub fn meets_capability(node: &NodeRecord, model: &ModelRecord) -> bool {
    if node.capabilities.total_memory_bytes > 0
        && node.capabilities.total_memory_bytes < model.size
    {
        return false;
    }
    if !model.family.is_empty()
        && !node.capabilities.families.is_empty()
        && !node.capabilities.families.contains(&model.family)
    {
        return false;
    }
    true
}

/// The canonical candidate ordering.
pub fn candidate_order(
    candidates: &mut [NodeRecord],
    model: &ModelRecord,
    model_counts: &HashMap<NodeId, usize>,
) {
    candidates.sort_by(|a, b| {
        let cap_a = meets_capability(a, model);
        let cap_b = meets_capability(b, model);
        cap_b
            .cmp(&cap_a)
            .then_with(|| {
                b.capabilities
                    .free_memory_bytes
                    .cmp(&a.capabilities.free_memory_bytes)
            })
            .then_with(|| {
                model_counts
                    .get(&a.id)
                    .unwrap_or(&0)
                    .cmp(model_counts.get(&b.id).unwrap_or(&0))
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Plans which nodes should receive new replicas of `model`, honoring the
/// configured strategy. Candidates are live nodes without any non-deleted
/// replica of the model.
pub fn plan_additions(
    model: &ModelRecord,
    strategy: PlacementStrategy,
    nodes: &[NodeRecord],
    replicas: &[ReplicaRecord],
    model_counts: &HashMap<NodeId, usize>,
    deficit: usize,
    min_replicas: usize,
) -> Vec<NodeId> {
    if deficit == 0 {
        return Vec::new();
    }
    let holding: HashSet<&NodeId> = replicas
        .iter()
        .filter(|r| r.status != ReplicaStatus::Deleted)
        .map(|r| &r.node)
        .collect();
    let mut candidates: Vec<NodeRecord> = nodes
        .iter()
        .filter(|n| n.state == NodeLifecycle::Live && !holding.contains(&n.id))
        .cloned()
        .collect();

    match strategy {
        PlacementStrategy::Random => {
            candidates.shuffle(&mut rand::thread_rng());
            candidates.into_iter().take(deficit).map(|n| n.id).collect()
        }
        PlacementStrategy::CapabilityAware => {
            candidates.retain(|n| meets_capability(n, model));
            candidate_order(&mut candidates, model, model_counts);
            candidates.into_iter().take(deficit).map(|n| n.id).collect()
        }
        PlacementStrategy::LocalityAware => {
            candidates.retain(|n| meets_capability(n, model));
            candidate_order(&mut candidates, model, model_counts);

            let existing_zones: HashSet<Option<String>> = replicas
                .iter()
                .filter(|r| r.status == ReplicaStatus::Ready)
                .filter_map(|r| nodes.iter().find(|n| n.id == r.node))
                .map(|n| n.zone.clone())
                .collect();

            let ready = replicas
                .iter()
                .filter(|r| r.status == ReplicaStatus::Ready)
                .count();
            let mut covered = existing_zones;
            let mut chosen = Vec::new();
            for _ in 0..deficit {
                let placed_total = ready + chosen.len();
                // Up to min, co-locate with existing replicas; beyond it,
                // spread across uncovered zones for fault tolerance.
                let pick = if placed_total < min_replicas && !covered.is_empty() {
                    candidates
                        .iter()
                        .position(|n| covered.contains(&n.zone))
                        .or_else(|| (!candidates.is_empty()).then_some(0))
                } else {
                    candidates
                        .iter()
                        .position(|n| !covered.contains(&n.zone))
                        .or_else(|| (!candidates.is_empty()).then_some(0))
                };
                let Some(index) = pick else { break };
                let node = candidates.remove(index);
                covered.insert(node.zone.clone());
                chosen.push(node.id);
            }
            chosen
        }
    }
}

/// Plans which ready replicas to drop when the count exceeds the policy
/// maximum: nodes holding the most models go first, then highest node id.
pub fn plan_removals(
    replicas: &[ReplicaRecord],
    model_counts: &HashMap<NodeId, usize>,
    excess: usize,
) -> Vec<NodeId> {
    let mut ready: Vec<&ReplicaRecord> = replicas
        .iter()
        .filter(|r| r.status == ReplicaStatus::Ready)
        .collect();
    ready.sort_by(|a, b| {
        model_counts
            .get(&b.node)
            .unwrap_or(&0)
            .cmp(model_counts.get(&a.node).unwrap_or(&0))
            .then_with(|| b.node.cmp(&a.node))
    });
    ready.into_iter().take(excess).map(|r| r.node.clone()).collect()
}

/// Chooses a transfer source among ready replicas: same zone first, then
/// lowest node id; draining and non-live nodes are skipped.
pub fn select_source(
    replicas: &[ReplicaRecord],
    nodes: &[NodeRecord],
    my_zone: &Option<String>,
    exclude: &NodeId,
) -> Option<NodeId> {
    let mut sources: Vec<&NodeRecord> = replicas
        .iter()
        .filter(|r| r.status == ReplicaStatus::Ready && r.node != *exclude)
        .filter_map(|r| nodes.iter().find(|n| n.id == r.node))
        .filter(|n| n.state == NodeLifecycle::Live)
        .collect();
    sources.sort_by(|a, b| {
        let local_a = a.zone == *my_zone;
        let local_b = b.zone == *my_zone;
        local_b.cmp(&local_a).then_with(|| a.id.cmp(&b.id))
    });
    sources.first().map(|n| n.id.clone())
}
