use infermesh::core::raft::{Entry, LogRecord, StateMachine};
use infermesh::core::state::types::{
    ModelRecord, NodeCapabilities, NodeLifecycle, NodeRecord, PlacementStrategy, ReplicaRecord,
    ReplicaStatus, ReplicationPolicy,
};
use infermesh::core::state::{StateEvent, StateStore, StateTopic, keys, proposal_validator};
use infermesh::core::transport::framing::to_wire;
use std::sync::Arc;

fn node_record(id: &str, state: NodeLifecycle) -> NodeRecord {
    NodeRecord {
        id: id.to_string(),
        addrs: vec![format!("{id}:7461")],
        gossip_addr: None,
        capabilities: NodeCapabilities::default(),
        state,
        last_heartbeat_ms: 0,
        version: "0.9.1".to_string(),
        zone: None,
        concurrency_cap: 8,
    }
}

fn model_record(id: &str) -> ModelRecord {
    ModelRecord {
        id: id.to_string(),
        name: id.to_string(),
        version: "latest".to_string(),
        family: String::new(),
        size: 100,
        chunks: Vec::new(),
        files: Vec::new(),
        root_digest: "r".repeat(64),
    }
}

fn replica_record(model: &str, node: &str, status: ReplicaStatus) -> ReplicaRecord {
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

fn apply_put(store: &StateStore, index: u64, key: Vec<u8>, value: Vec<u8>) {
    store.apply(&Entry {
        term: 1,
        index,
        record: LogRecord::Put { key, value },
    });
}

#[tokio::test]
async fn test_put_then_read_yields_the_record() {
    let store = StateStore::new(16);
    let record = node_record("n1", NodeLifecycle::Live);
    apply_put(&store, 1, keys::node_key(&record.id), to_wire(&record).unwrap());
    assert_eq!(store.node(&"n1".to_string()).unwrap(), record);
    assert_eq!(store.applied_index(), 1);
}

#[tokio::test]
async fn test_delete_is_observed() {
    let store = StateStore::new(16);
    let record = node_record("n1", NodeLifecycle::Live);
    apply_put(&store, 1, keys::node_key(&record.id), to_wire(&record).unwrap());
    store.apply(&Entry {
        term: 1,
        index: 2,
        record: LogRecord::Delete {
            key: keys::node_key(&record.id),
        },
    });
    assert!(store.node(&"n1".to_string()).is_none());
}

#[tokio::test]
async fn test_events_arrive_in_commit_order() {
    let store = StateStore::new(16);
    let mut rx = store.subscribe(StateTopic::Node);

    for (i, id) in ["n1", "n2", "n3"].iter().enumerate() {
        let record = node_record(id, NodeLifecycle::Live);
        apply_put(
            &store,
            i as u64 + 1,
            keys::node_key(&record.id),
            to_wire(&record).unwrap(),
        );
    }

    for expected in ["n1", "n2", "n3"] {
        match rx.recv().await.unwrap() {
            StateEvent::NodeUpdated(record) => assert_eq!(record.id, expected),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_overflowing_subscriber_gets_lagged_marker() {
    let store = StateStore::new(2);
    let mut rx = store.subscribe(StateTopic::Node);

    // Four events into a queue of two: the tail is dropped.
    for i in 0..4u64 {
        let record = node_record(&format!("n{i}"), NodeLifecycle::Live);
        apply_put(
            &store,
            i + 1,
            keys::node_key(&record.id),
            to_wire(&record).unwrap(),
        );
    }
    // Drain the queue, then trigger one more event so the lag marker can
    // be delivered.
    let mut saw_lagged = false;
    for _ in 0..2 {
        rx.recv().await.unwrap();
    }
    let record = node_record("n9", NodeLifecycle::Live);
    apply_put(&store, 10, keys::node_key(&record.id), to_wire(&record).unwrap());
    while let Ok(event) = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await {
        match event {
            Some(StateEvent::Lagged) => {
                saw_lagged = true;
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(saw_lagged);
}

#[tokio::test]
async fn test_serving_candidates_requires_live_node_and_ready_replica() {
    let store = StateStore::new(16);
    let model = model_record("m");
    apply_put(&store, 1, keys::model_key(&model.id), to_wire(&model).unwrap());

    let live = node_record("n1", NodeLifecycle::Live);
    let down = node_record("n2", NodeLifecycle::Down);
    let draining = node_record("n3", NodeLifecycle::Draining);
    for (i, n) in [&live, &down, &draining].iter().enumerate() {
        apply_put(&store, i as u64 + 2, keys::node_key(&n.id), to_wire(*n).unwrap());
    }

    let combos = [
        ("n1", ReplicaStatus::Ready),
        ("n2", ReplicaStatus::Ready),
        ("n3", ReplicaStatus::Ready),
    ];
    for (i, (node, status)) in combos.iter().enumerate() {
        let r = replica_record("m", node, *status);
        apply_put(
            &store,
            i as u64 + 5,
            keys::replica_key(&r.model, &r.node),
            to_wire(&r).unwrap(),
        );
    }
    // A transferring replica on the live node for a second model must not
    // qualify either.
    let candidates = store.serving_candidates(&"m".to_string());
    let ids: Vec<&str> = candidates.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, ["n1"]);
}

#[tokio::test]
async fn test_snapshot_restore_round_trip() {
    let store = StateStore::new(16);
    let record = node_record("n1", NodeLifecycle::Live);
    apply_put(&store, 7, keys::node_key(&record.id), to_wire(&record).unwrap());
    let image = store.snapshot().unwrap();

    let restored = StateStore::new(16);
    restored.restore(&image).unwrap();
    assert_eq!(restored.node(&"n1".to_string()).unwrap(), record);
    assert_eq!(restored.applied_index(), 7);
}

#[tokio::test]
async fn test_wait_applied_resolves_when_index_reached() {
    let store = Arc::new(StateStore::new(16));
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_applied(3).await })
    };
    for i in 1..=3u64 {
        let record = node_record(&format!("n{i}"), NodeLifecycle::Live);
        apply_put(
            &store,
            i,
            keys::node_key(&record.id),
            to_wire(&record).unwrap(),
        );
    }
    tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// --- Proposal validation ---

#[tokio::test]
async fn test_validator_rejects_impersonated_node_record() {
    let store = Arc::new(StateStore::new(16));
    let validator = proposal_validator(store.clone(), "leader".to_string());
    let record = node_record("victim", NodeLifecycle::Live);
    let put = LogRecord::Put {
        key: keys::node_key(&record.id),
        value: to_wire(&record).unwrap(),
    };
    // A third node may not write someone else's record.
    assert!(validator(&put, &"attacker".to_string()).is_err());
    // The node itself and the leader may.
    assert!(validator(&put, &"victim".to_string()).is_ok());
    assert!(validator(&put, &"leader".to_string()).is_ok());
}

#[tokio::test]
async fn test_validator_rejects_replica_without_node_or_model() {
    let store = Arc::new(StateStore::new(16));
    let validator = proposal_validator(store.clone(), "leader".to_string());
    let r = replica_record("m", "n1", ReplicaStatus::Pending);
    let put = LogRecord::Put {
        key: keys::replica_key(&r.model, &r.node),
        value: to_wire(&r).unwrap(),
    };
    assert!(validator(&put, &"leader".to_string()).is_err());

    // With both present the replica is accepted.
    let node = node_record("n1", NodeLifecycle::Live);
    apply_put(&store, 1, keys::node_key(&node.id), to_wire(&node).unwrap());
    let model = model_record("m");
    apply_put(&store, 2, keys::model_key(&model.id), to_wire(&model).unwrap());
    assert!(validator(&put, &"leader".to_string()).is_ok());
}

#[tokio::test]
async fn test_validator_enforces_policy_bounds() {
    let store = Arc::new(StateStore::new(16));
    let validator = proposal_validator(store.clone(), "leader".to_string());

    let bad_min = ReplicationPolicy {
        model: "m".to_string(),
        min: 0,
        max: 2,
        strategy: PlacementStrategy::CapabilityAware,
    };
    let put = LogRecord::Put {
        key: keys::policy_key(&bad_min.model),
        value: to_wire(&bad_min).unwrap(),
    };
    assert!(validator(&put, &"leader".to_string()).is_err());

    let bad_max = ReplicationPolicy {
        min: 3,
        max: 2,
        ..bad_min.clone()
    };
    let put = LogRecord::Put {
        key: keys::policy_key(&bad_max.model),
        value: to_wire(&bad_max).unwrap(),
    };
    assert!(validator(&put, &"leader".to_string()).is_err());

    let good = ReplicationPolicy {
        min: 2,
        max: 0,
        ..bad_min
    };
    let put = LogRecord::Put {
        key: keys::policy_key(&good.model),
        value: to_wire(&good).unwrap(),
    };
    assert!(validator(&put, &"leader".to_string()).is_ok());
}

#[tokio::test]
async fn test_validator_rejects_model_mutation() {
    let store = Arc::new(StateStore::new(16));
    let validator = proposal_validator(store.clone(), "leader".to_string());
    let model = model_record("m");
    apply_put(&store, 1, keys::model_key(&model.id), to_wire(&model).unwrap());

    // Republishing identical content is idempotent.
    let same = LogRecord::Put {
        key: keys::model_key(&model.id),
        value: to_wire(&model).unwrap(),
    };
    assert!(validator(&same, &"n1".to_string()).is_ok());

    // Different content under the same id is not.
    let mut changed = model.clone();
    changed.size = 999;
    let put = LogRecord::Put {
        key: keys::model_key(&changed.id),
        value: to_wire(&changed).unwrap(),
    };
    assert!(validator(&put, &"n1".to_string()).is_err());
}

#[tokio::test]
async fn test_validator_blocks_model_delete_with_replicas() {
    let store = Arc::new(StateStore::new(16));
    let validator = proposal_validator(store.clone(), "leader".to_string());

    let node = node_record("n1", NodeLifecycle::Live);
    apply_put(&store, 1, keys::node_key(&node.id), to_wire(&node).unwrap());
    let model = model_record("m");
    apply_put(&store, 2, keys::model_key(&model.id), to_wire(&model).unwrap());
    let r = replica_record("m", "n1", ReplicaStatus::Ready);
    apply_put(
        &store,
        3,
        keys::replica_key(&r.model, &r.node),
        to_wire(&r).unwrap(),
    );

    let del = LogRecord::Delete {
        key: keys::model_key(&model.id),
    };
    assert!(validator(&del, &"leader".to_string()).is_err());

    store.apply(&Entry {
        term: 1,
        index: 4,
        record: LogRecord::Delete {
            key: keys::replica_key(&r.model, &r.node),
        },
    });
    assert!(validator(&del, &"leader".to_string()).is_ok());
}
