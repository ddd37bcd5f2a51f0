use async_trait::async_trait;
use infermesh::MeshError;
use infermesh::config::RaftConfig;
use infermesh::core::raft::net::RaftNetwork;
use infermesh::core::raft::storage::LogStore;
use infermesh::core::raft::{
    self, LogRecord, MembershipOp, Raft, RaftRpc, RaftRpcResponse,
};
use infermesh::core::state::keys;
use infermesh::core::state::StateStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Delivers RPCs directly into peer cores; the network equivalent of a
/// perfectly reliable LAN.
struct Loopback {
    me: String,
    registry: Arc<parking_lot::RwLock<HashMap<String, Raft>>>,
}

#[async_trait]
impl RaftNetwork for Loopback {
    async fn send(&self, to: &String, rpc: RaftRpc) -> Result<RaftRpcResponse, MeshError> {
        let target = { self.registry.read().get(to).cloned() };
        match target {
            Some(raft) => Ok(raft.rpc(self.me.clone(), rpc).await),
            None => Err(MeshError::Unreachable(to.clone())),
        }
    }
}

struct TestNode {
    raft: Raft,
    store: Arc<StateStore>,
    _dir: tempfile::TempDir,
}

fn build_node(
    id: &str,
    registry: &Arc<parking_lot::RwLock<HashMap<String, Raft>>>,
    shutdown_tx: &broadcast::Sender<()>,
    bootstrap: bool,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::new(64));
    let log = LogStore::open(dir.path()).unwrap();
    let network = Arc::new(Loopback {
        me: id.to_string(),
        registry: registry.clone(),
    });
    let (raft, _task) = raft::build(
        id.to_string(),
        RaftConfig::default(),
        log,
        network,
        store.clone(),
        None,
        bootstrap,
        shutdown_tx.subscribe(),
    )
    .unwrap();
    registry.write().insert(id.to_string(), raft.clone());
    TestNode {
        raft,
        store,
        _dir: dir,
    }
}

async fn wait_for_leadership(raft: &Raft) {
    let mut rx = raft.watch_status();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.borrow().is_leader() {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("node did not win an election in time");
}

fn put(key: &str, value: &str) -> LogRecord {
    LogRecord::Put {
        key: keys::cfg_key(key),
        value: value.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn test_single_node_bootstrap_elects_itself() {
    let registry = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let n1 = build_node("n1", &registry, &shutdown_tx, true);

    wait_for_leadership(&n1.raft).await;
    let status = n1.raft.status();
    assert_eq!(status.leader.as_deref(), Some("n1"));
    assert!(status.membership.voters.contains("n1"));
}

#[tokio::test]
async fn test_propose_then_local_read_yields_value() {
    let registry = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let n1 = build_node("n1", &registry, &shutdown_tx, true);
    wait_for_leadership(&n1.raft).await;

    let index = n1.raft.propose(put("greeting", "hello")).await.unwrap();
    n1.store.wait_applied(index).await.unwrap();
    assert_eq!(n1.store.cfg_get("greeting").unwrap(), b"hello");
}

#[tokio::test]
async fn test_read_barrier_covers_prior_writes() {
    let registry = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let n1 = build_node("n1", &registry, &shutdown_tx, true);
    wait_for_leadership(&n1.raft).await;

    let index = n1.raft.propose(put("k", "v")).await.unwrap();
    let read_index = n1.raft.read_barrier().await.unwrap();
    assert!(read_index >= index);
    n1.store.wait_applied(read_index).await.unwrap();
    assert_eq!(n1.store.cfg_get("k").unwrap(), b"v");
}

#[tokio::test]
async fn test_membership_growth_replicates_to_all_voters() {
    let registry = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let n1 = build_node("n1", &registry, &shutdown_tx, true);
    let n2 = build_node("n2", &registry, &shutdown_tx, false);
    let n3 = build_node("n3", &registry, &shutdown_tx, false);
    wait_for_leadership(&n1.raft).await;

    n1.raft
        .change_membership(MembershipOp::AddVoter("n2".to_string()))
        .await
        .unwrap();
    n1.raft
        .change_membership(MembershipOp::AddVoter("n3".to_string()))
        .await
        .unwrap();

    let index = n1.raft.propose(put("replicated", "yes")).await.unwrap();
    for node in [&n1, &n2, &n3] {
        tokio::time::timeout(Duration::from_secs(5), node.store.wait_applied(index))
            .await
            .expect("follower did not apply in time")
            .unwrap();
        assert_eq!(node.store.cfg_get("replicated").unwrap(), b"yes");
    }
    assert_eq!(n1.raft.status().membership.voters.len(), 3);
}

#[tokio::test]
async fn test_followers_reject_writes_with_leader_hint() {
    let registry = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let n1 = build_node("n1", &registry, &shutdown_tx, true);
    let n2 = build_node("n2", &registry, &shutdown_tx, false);
    wait_for_leadership(&n1.raft).await;

    n1.raft
        .change_membership(MembershipOp::AddVoter("n2".to_string()))
        .await
        .unwrap();
    // Give the follower a heartbeat round to learn the leader.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = n2.raft.propose(put("x", "y")).await.unwrap_err();
    match err {
        MeshError::NotLeader(hint) => assert_eq!(hint.as_deref(), Some("n1")),
        other => panic!("expected NotLeader, got {other}"),
    }
}

#[tokio::test]
async fn test_membership_changes_are_serialized() {
    let registry = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let n1 = build_node("n1", &registry, &shutdown_tx, true);
    let n2 = build_node("n2", &registry, &shutdown_tx, false);
    let _n3 = build_node("n3", &registry, &shutdown_tx, false);
    wait_for_leadership(&n1.raft).await;
    n1.raft
        .change_membership(MembershipOp::AddVoter("n2".to_string()))
        .await
        .unwrap();
    let _ = n2;

    // Two concurrent single-server changes: at most one may be in flight.
    let a = n1
        .raft
        .change_membership(MembershipOp::AddVoter("n3".to_string()));
    let b = n1
        .raft
        .change_membership(MembershipOp::DemoteVoter("n2".to_string()));
    let (ra, rb) = tokio::join!(a, b);
    let failures = [&ra, &rb]
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(MeshError::InvalidRequest(_)) | Err(MeshError::CommitTimeout)
            )
        })
        .count();
    // Either the second was rejected outright, or both landed one after
    // the other; what must never happen is a silent double-apply.
    assert!(failures <= 1);
    assert!(ra.is_ok() || rb.is_ok());
}

#[tokio::test]
async fn test_snapshot_trigger_then_continue() {
    let registry = Arc::new(parking_lot::RwLock::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let n1 = build_node("n1", &registry, &shutdown_tx, true);
    wait_for_leadership(&n1.raft).await;

    for i in 0..20 {
        n1.raft
            .propose(put(&format!("k{i}"), "v"))
            .await
            .unwrap();
    }
    n1.raft.trigger_snapshot().await.unwrap();

    // The log keeps working after compaction.
    let index = n1.raft.propose(put("after", "snapshot")).await.unwrap();
    n1.store.wait_applied(index).await.unwrap();
    assert_eq!(n1.store.cfg_get("after").unwrap(), b"snapshot");
    assert_eq!(n1.store.cfg_get("k0").unwrap(), b"v");
}
