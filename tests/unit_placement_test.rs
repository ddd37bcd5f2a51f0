use infermesh::core::distribution::placement::{
    candidate_order, meets_capability, plan_additions, plan_removals, select_source,
};
use infermesh::core::state::types::{
    ChunkInfo, ModelRecord, NodeCapabilities, NodeLifecycle, NodeRecord, PlacementStrategy,
    ReplicaRecord, ReplicaStatus,
};
use std::collections::HashMap;

fn node(id: &str, free_memory: u64, state: NodeLifecycle, zone: Option<&str>) -> NodeRecord {
    NodeRecord {
        id: id.to_string(),
        addrs: vec![format!("{id}.local:7461")],
        gossip_addr: None,
        capabilities: NodeCapabilities {
            cpu_cores: 8,
            total_memory_bytes: 64 << 30,
            free_memory_bytes: free_memory,
            gpus: Vec::new(),
            families: Vec::new(),
        },
        state,
        last_heartbeat_ms: 0,
        version: "0.9.1".to_string(),
        zone: zone.map(String::from),
        concurrency_cap: 8,
    }
}

fn model(id: &str, size: u64) -> ModelRecord {
    ModelRecord {
        id: id.to_string(),
        name: id.to_string(),
        version: "latest".to_string(),
        family: String::new(),
        size,
        chunks: vec![ChunkInfo {
            index: 0,
            offset: 0,
            length: size as u32,
            digest: "d".repeat(64),
        }],
        files: Vec::new(),
        root_digest: "r".repeat(64),
    }
}

fn replica(model: &str, node: &str, status: ReplicaStatus) -> ReplicaRecord {
    ReplicaRecord {
        model: model.to_string(),
        node: node.to_string(),
        status,
        bytes_transferred: 0,
        last_verified_ms: 0,
        error: None,
        source_hint: None,
    }
}

#[tokio::test]
async fn test_capability_filter_excludes_small_nodes() {
    let mut small = node("n1", 1 << 30, NodeLifecycle::Live, None);
    small.capabilities.total_memory_bytes = 1 << 30;
    let big = node("n2", 32 << 30, NodeLifecycle::Live, None);
    let m = model("m", 8 << 30);
    assert!(!meets_capability(&small, &m));
    assert!(meets_capability(&big, &m));
}

#[tokio::test]
async fn test_candidate_order_is_deterministic() {
    let m = model("m", 1 << 20);
    let mut counts = HashMap::new();
    counts.insert("n1".to_string(), 3usize);
    counts.insert("n2".to_string(), 0usize);
    counts.insert("n3".to_string(), 0usize);

    // n2 and n3 tie on free memory and model count; node id breaks the tie.
    let mut candidates = vec![
        node("n3", 16 << 30, NodeLifecycle::Live, None),
        node("n1", 32 << 30, NodeLifecycle::Live, None),
        node("n2", 16 << 30, NodeLifecycle::Live, None),
    ];
    candidate_order(&mut candidates, &m, &counts);
    let ids: Vec<String> = candidates.iter().map(|n| n.id.clone()).collect();
    assert_eq!(ids, ["n1", "n2", "n3"]);

    // Running it again yields the same order.
    candidate_order(&mut candidates, &m, &counts);
    let again: Vec<String> = candidates.iter().map(|n| n.id.clone()).collect();
    assert_eq!(again, ids);
}

#[tokio::test]
async fn test_plan_additions_skips_holders_and_non_live_nodes() {
    let m = model("m", 1 << 20);
    let nodes = vec![
        node("n1", 32 << 30, NodeLifecycle::Live, None),
        node("n2", 32 << 30, NodeLifecycle::Down, None),
        node("n3", 16 << 30, NodeLifecycle::Live, None),
    ];
    let replicas = vec![replica("m", "n1", ReplicaStatus::Ready)];
    let chosen = plan_additions(
        &m,
        PlacementStrategy::CapabilityAware,
        &nodes,
        &replicas,
        &HashMap::new(),
        2,
        2,
    );
    // Only n3 qualifies: n1 already holds the model, n2 is down.
    assert_eq!(chosen, vec!["n3".to_string()]);
}

#[tokio::test]
async fn test_plan_additions_zero_deficit_is_a_no_op() {
    let m = model("m", 1 << 20);
    let nodes = vec![node("n1", 32 << 30, NodeLifecycle::Live, None)];
    let chosen = plan_additions(
        &m,
        PlacementStrategy::CapabilityAware,
        &nodes,
        &[],
        &HashMap::new(),
        0,
        2,
    );
    assert!(chosen.is_empty());
}

#[tokio::test]
async fn test_locality_aware_prefers_existing_zone_up_to_min_then_spreads() {
    let m = model("m", 1 << 20);
    let nodes = vec![
        node("n1", 32 << 30, NodeLifecycle::Live, Some("zone-a")),
        node("n2", 32 << 30, NodeLifecycle::Live, Some("zone-a")),
        node("n3", 32 << 30, NodeLifecycle::Live, Some("zone-b")),
    ];
    let replicas = vec![replica("m", "n1", ReplicaStatus::Ready)];
    // min=2: the second replica co-locates in zone-a; the third spreads.
    let chosen = plan_additions(
        &m,
        PlacementStrategy::LocalityAware,
        &nodes,
        &replicas,
        &HashMap::new(),
        2,
        2,
    );
    assert_eq!(chosen, vec!["n2".to_string(), "n3".to_string()]);
}

#[tokio::test]
async fn test_plan_removals_drops_busiest_nodes_first() {
    let replicas = vec![
        replica("m", "n1", ReplicaStatus::Ready),
        replica("m", "n2", ReplicaStatus::Ready),
        replica("m", "n3", ReplicaStatus::Ready),
    ];
    let mut counts = HashMap::new();
    counts.insert("n1".to_string(), 1usize);
    counts.insert("n2".to_string(), 5usize);
    counts.insert("n3".to_string(), 2usize);
    let removed = plan_removals(&replicas, &counts, 1);
    assert_eq!(removed, vec!["n2".to_string()]);
}

#[tokio::test]
async fn test_select_source_prefers_same_zone_and_skips_draining() {
    let nodes = vec![
        node("n1", 32 << 30, NodeLifecycle::Draining, Some("zone-a")),
        node("n2", 32 << 30, NodeLifecycle::Live, Some("zone-b")),
        node("n3", 32 << 30, NodeLifecycle::Live, Some("zone-a")),
    ];
    let replicas = vec![
        replica("m", "n1", ReplicaStatus::Ready),
        replica("m", "n2", ReplicaStatus::Ready),
        replica("m", "n3", ReplicaStatus::Ready),
    ];
    let my_zone = Some("zone-a".to_string());
    let source = select_source(&replicas, &nodes, &my_zone, &"n9".to_string());
    // n1 shares the zone but is draining; n3 is the zone-local live source.
    assert_eq!(source, Some("n3".to_string()));
}

#[tokio::test]
async fn test_select_source_excludes_requester() {
    let nodes = vec![node("n1", 32 << 30, NodeLifecycle::Live, None)];
    let replicas = vec![replica("m", "n1", ReplicaStatus::Ready)];
    assert_eq!(
        select_source(&replicas, &nodes, &None, &"n1".to_string()),
        None
    );
}
