use infermesh::core::raft::{Entry, LogRecord, StateMachine};
use infermesh::core::scheduler::RouteTable;
use infermesh::core::state::types::{
    ModelRecord, NodeCapabilities, NodeLifecycle, NodeRecord, ReplicaRecord, ReplicaStatus,
};
use infermesh::core::state::{StateStore, keys};
use infermesh::core::transport::framing::to_wire;
use std::sync::Arc;

fn apply_put(store: &StateStore, index: u64, key: Vec<u8>, value: Vec<u8>) {
    store.apply(&Entry {
        term: 1,
        index,
        record: LogRecord::Put { key, value },
    });
}

fn seed_node(store: &StateStore, index: u64, id: &str, state: NodeLifecycle) {
    let node = NodeRecord {
        id: id.to_string(),
        addrs: Vec::new(),
        gossip_addr: None,
        capabilities: NodeCapabilities::default(),
        state,
        last_heartbeat_ms: 0,
        version: "test".to_string(),
        zone: None,
        concurrency_cap: 8,
    };
    apply_put(store, index, keys::node_key(&node.id), to_wire(&node).unwrap());
}

fn seed_model(store: &StateStore, index: u64, id: &str) {
    let model = ModelRecord {
        id: id.to_string(),
        name: id.to_string(),
        version: "latest".to_string(),
        family: String::new(),
        size: 1,
        chunks: Vec::new(),
        files: Vec::new(),
        root_digest: "r".repeat(64),
    };
    apply_put(store, index, keys::model_key(&model.id), to_wire(&model).unwrap());
}

fn seed_replica(store: &StateStore, index: u64, model: &str, node: &str, status: ReplicaStatus) {
    let replica = ReplicaRecord {
        model: model.to_string(),
        node: node.to_string(),
        status,
        bytes_transferred: 0,
        last_verified_ms: 0,
        error: None,
        source_hint: None,
    };
    apply_put(
        store,
        index,
        keys::replica_key(&replica.model, &replica.node),
        to_wire(&replica).unwrap(),
    );
}

#[tokio::test]
async fn test_candidates_resolve_from_current_state() {
    let store = Arc::new(StateStore::new(16));
    seed_model(&store, 1, "m");
    seed_node(&store, 2, "n1", NodeLifecycle::Live);
    seed_node(&store, 3, "n2", NodeLifecycle::Live);
    seed_replica(&store, 4, "m", "n1", ReplicaStatus::Ready);
    seed_replica(&store, 5, "m", "n2", ReplicaStatus::Transferring);

    let routes = RouteTable::new(store);
    let candidates = routes.candidates(&"m".to_string());
    let ids: Vec<&str> = candidates.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, ["n1"]);
}

#[tokio::test]
async fn test_cached_route_revalidates_against_store() {
    let store = Arc::new(StateStore::new(16));
    seed_model(&store, 1, "m");
    seed_node(&store, 2, "n1", NodeLifecycle::Live);
    seed_replica(&store, 3, "m", "n1", ReplicaStatus::Ready);

    let routes = RouteTable::new(store.clone());
    assert_eq!(routes.candidates(&"m".to_string()).len(), 1);

    // The node goes down; the cached id must not resolve anymore, even
    // before a rebuild event is processed.
    seed_node(&store, 4, "n1", NodeLifecycle::Down);
    assert!(routes.candidates(&"m".to_string()).is_empty());
}

#[tokio::test]
async fn test_replica_error_removes_candidate() {
    let store = Arc::new(StateStore::new(16));
    seed_model(&store, 1, "m");
    seed_node(&store, 2, "n1", NodeLifecycle::Live);
    seed_replica(&store, 3, "m", "n1", ReplicaStatus::Ready);

    let routes = RouteTable::new(store.clone());
    assert_eq!(routes.candidates(&"m".to_string()).len(), 1);

    seed_replica(&store, 4, "m", "n1", ReplicaStatus::Error);
    assert!(routes.candidates(&"m".to_string()).is_empty());
}

#[tokio::test]
async fn test_unknown_model_has_no_candidates() {
    let store = Arc::new(StateStore::new(16));
    let routes = RouteTable::new(store);
    assert!(routes.candidates(&"missing".to_string()).is_empty());
}
