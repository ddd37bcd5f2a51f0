use infermesh::MeshError;
use infermesh::config::TransportConfig;
use infermesh::core::distribution::cas::ChunkStore;
use infermesh::core::distribution::manifest::{build_record, chunk_into_store, verify_on_disk};
use infermesh::core::distribution::transfer::{TransferServer, fetch_missing};
use infermesh::core::identity::NodeIdentity;
use infermesh::core::raft::{Entry, LogRecord, StateMachine};
use infermesh::core::state::types::{
    ModelRecord, NodeCapabilities, NodeLifecycle, NodeRecord, ReplicaRecord, ReplicaStatus,
};
use infermesh::core::state::{StateStore, keys};
use infermesh::core::transport::framing::to_wire;
use infermesh::core::transport::{ProtocolId, Transport};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

struct TestPeer {
    transport: Arc<Transport>,
    addr: String,
    store: Arc<StateStore>,
    cas: Arc<ChunkStore>,
    _dir: tempfile::TempDir,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn start_peer() -> TestPeer {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(NodeIdentity::load_or_generate(dir.path()).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (transport, incoming_rx) = Transport::new(
        identity,
        TransportConfig::default(),
        "transfer-test".to_string(),
        vec![addr.clone()],
        "127.0.0.1:1".to_string(),
        Vec::new(),
        None,
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(
        transport
            .clone()
            .run_dispatcher(incoming_rx, shutdown_tx.subscribe()),
    );
    tokio::spawn(
        transport
            .clone()
            .run_listener(listener, shutdown_tx.subscribe()),
    );

    TestPeer {
        transport,
        addr,
        store: Arc::new(StateStore::new(64)),
        cas: Arc::new(ChunkStore::new(dir.path())),
        _dir: dir,
        _shutdown_tx: shutdown_tx,
    }
}

fn apply_put(store: &StateStore, index: u64, key: Vec<u8>, value: Vec<u8>) {
    store.apply(&Entry {
        term: 1,
        index,
        record: LogRecord::Put { key, value },
    });
}

/// Registers the node, the model, and a ready replica in a peer's state
/// store so it qualifies as a transfer source.
fn seed_source(peer: &TestPeer, record: &ModelRecord, state: NodeLifecycle) {
    let node_id = peer.transport.local_id().clone();
    let node = NodeRecord {
        id: node_id.clone(),
        addrs: vec![peer.addr.clone()],
        gossip_addr: None,
        capabilities: NodeCapabilities::default(),
        state,
        last_heartbeat_ms: 0,
        version: "test".to_string(),
        zone: None,
        concurrency_cap: 8,
    };
    apply_put(
        &peer.store,
        1,
        keys::node_key(&node.id),
        to_wire(&node).unwrap(),
    );
    apply_put(
        &peer.store,
        2,
        keys::model_key(&record.id),
        to_wire(record).unwrap(),
    );
    let replica = ReplicaRecord {
        model: record.id.clone(),
        node: node_id,
        status: ReplicaStatus::Ready,
        bytes_transferred: record.size,
        last_verified_ms: 0,
        error: None,
        source_hint: None,
    };
    apply_put(
        &peer.store,
        3,
        keys::replica_key(&replica.model, &replica.node),
        to_wire(&replica).unwrap(),
    );
}

fn spawn_transfer_server(peer: &TestPeer) -> broadcast::Sender<()> {
    let rx = peer
        .transport
        .register_handler(ProtocolId::ChunkTransfer, 8);
    let server = Arc::new(TransferServer::new(
        peer.transport.local_id().clone(),
        peer.store.clone(),
        peer.cas.clone(),
        8,
        4,
    ));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    tokio::spawn(server.run(rx, shutdown_tx.subscribe()));
    shutdown_tx
}

async fn make_model(cas: &ChunkStore, data: &[u8], chunk_size: usize) -> ModelRecord {
    let chunks = chunk_into_store(cas, data, chunk_size).await.unwrap();
    build_record(
        "m:1".to_string(),
        "m".to_string(),
        "1".to_string(),
        String::new(),
        data.len() as u64,
        chunks,
        Vec::new(),
    )
}

#[tokio::test]
async fn test_full_transfer_produces_identical_chunks() {
    let source = start_peer().await;
    let sink = start_peer().await;

    let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let record = make_model(&source.cas, &data, 4096).await;
    seed_source(&source, &record, NodeLifecycle::Live);
    let _server = spawn_transfer_server(&source);

    let session = sink.transport.connect_addr(&source.addr).await.unwrap();
    let stream = session
        .open_stream(ProtocolId::ChunkTransfer)
        .await
        .unwrap();
    let progress = AtomicU64::new(0);
    fetch_missing(stream, &record, &sink.cas, &progress)
        .await
        .unwrap();

    assert_eq!(progress.load(Ordering::Relaxed), data.len() as u64);
    verify_on_disk(&sink.cas, &record).await.unwrap();
    for chunk in &record.chunks {
        assert_eq!(
            sink.cas.get(&chunk.digest).await.unwrap().unwrap(),
            source.cas.get(&chunk.digest).await.unwrap().unwrap()
        );
    }
}

#[tokio::test]
async fn test_partial_transfer_only_moves_missing_chunks() {
    let source = start_peer().await;
    let sink = start_peer().await;

    let data = vec![5u8; 20_000];
    let record = make_model(&source.cas, &data, 4096).await;
    seed_source(&source, &record, NodeLifecycle::Live);
    let _server = spawn_transfer_server(&source);

    // Pre-seed the sink with the first two chunks; dedup means only the
    // remainder crosses the wire.
    for chunk in &record.chunks[..2] {
        let bytes = source.cas.get(&chunk.digest).await.unwrap().unwrap();
        sink.cas.put(&chunk.digest, &bytes).await.unwrap();
    }

    let session = sink.transport.connect_addr(&source.addr).await.unwrap();
    let stream = session
        .open_stream(ProtocolId::ChunkTransfer)
        .await
        .unwrap();
    let progress = AtomicU64::new(0);
    fetch_missing(stream, &record, &sink.cas, &progress)
        .await
        .unwrap();
    verify_on_disk(&sink.cas, &record).await.unwrap();
}

#[tokio::test]
async fn test_draining_source_refuses_new_transfers() {
    let source = start_peer().await;
    let sink = start_peer().await;

    let data = vec![1u8; 10_000];
    let record = make_model(&source.cas, &data, 4096).await;
    seed_source(&source, &record, NodeLifecycle::Draining);
    let _server = spawn_transfer_server(&source);

    let session = sink.transport.connect_addr(&source.addr).await.unwrap();
    let stream = session
        .open_stream(ProtocolId::ChunkTransfer)
        .await
        .unwrap();
    let progress = AtomicU64::new(0);
    let err = fetch_missing(stream, &record, &sink.cas, &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Draining));
}

#[tokio::test]
async fn test_unknown_model_is_refused() {
    let source = start_peer().await;
    let sink = start_peer().await;
    let _server = spawn_transfer_server(&source);

    let data = vec![2u8; 5_000];
    // The record exists only on the sink side; the source never saw it.
    let record = make_model(&sink.cas, &data, 4096).await;
    sink.cas.remove(&record.chunks[0].digest).await.unwrap();

    let session = sink.transport.connect_addr(&source.addr).await.unwrap();
    let stream = session
        .open_stream(ProtocolId::ChunkTransfer)
        .await
        .unwrap();
    let progress = AtomicU64::new(0);
    let err = fetch_missing(stream, &record, &sink.cas, &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NotFound(_)));
}
