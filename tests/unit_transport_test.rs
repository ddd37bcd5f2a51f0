use infermesh::MeshError;
use infermesh::config::TransportConfig;
use infermesh::core::health::HealthMsg;
use infermesh::core::identity::NodeIdentity;
use infermesh::core::state::types::NodeCapabilities;
use infermesh::core::transport::{ProtocolId, Transport};
use std::sync::Arc;
use tokio::sync::broadcast;

struct TestTransport {
    transport: Arc<Transport>,
    addr: String,
    _dir: tempfile::TempDir,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn start_transport(rendezvous: &str) -> TestTransport {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(NodeIdentity::load_or_generate(dir.path()).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (transport, incoming_rx) = Transport::new(
        identity,
        TransportConfig::default(),
        rendezvous.to_string(),
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
    TestTransport {
        transport,
        addr,
        _dir: dir,
        _shutdown_tx: shutdown_tx,
    }
}

fn serve_health_pongs(transport: &Transport) {
    let mut rx = transport.register_handler(ProtocolId::Health, 8);
    tokio::spawn(async move {
        while let Some(incoming) = rx.recv().await {
            tokio::spawn(async move {
                let mut stream = incoming.stream;
                while let Ok(HealthMsg::Probe) = stream.recv_msg::<HealthMsg>().await {
                    let pong = HealthMsg::Pong {
                        version: "test".to_string(),
                        capabilities: NodeCapabilities::default(),
                    };
                    if stream.send_msg(&pong).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn test_connect_handshake_and_request_response() {
    let a = start_transport("shared-secret").await;
    let b = start_transport("shared-secret").await;
    serve_health_pongs(&b.transport);

    let session = a.transport.connect_addr(&b.addr).await.unwrap();
    let peer_id = session.peer_id.clone();
    assert_eq!(peer_id, *b.transport.local_id());

    let response: HealthMsg = a
        .transport
        .send(&peer_id, ProtocolId::Health, &HealthMsg::Probe)
        .await
        .unwrap();
    assert!(matches!(response, HealthMsg::Pong { .. }));
}

#[tokio::test]
async fn test_sessions_are_pooled_per_peer() {
    let a = start_transport("shared-secret").await;
    let b = start_transport("shared-secret").await;
    serve_health_pongs(&b.transport);

    let first = a.transport.connect_addr(&b.addr).await.unwrap();
    let peer_id = first.peer_id.clone();
    // A subsequent connect by id reuses the pooled session.
    let second = a.transport.connect(&peer_id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_rendezvous_mismatch_refuses_to_mesh() {
    let a = start_transport("cluster-one").await;
    let b = start_transport("cluster-two").await;

    let err = a.transport.connect_addr(&b.addr).await.unwrap_err();
    assert!(
        matches!(err, MeshError::AuthFailed(_) | MeshError::StreamClosed),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_denied_peer_is_rejected() {
    let a = start_transport("shared-secret").await;
    let b = start_transport("shared-secret").await;

    b.transport.set_denied(a.transport.local_id().clone(), true);
    let result = a.transport.connect_addr(&b.addr).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_concurrent_streams_multiplex_over_one_session() {
    let a = start_transport("shared-secret").await;
    let b = start_transport("shared-secret").await;
    serve_health_pongs(&b.transport);

    let session = a.transport.connect_addr(&b.addr).await.unwrap();
    let peer_id = session.peer_id.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let transport = a.transport.clone();
        let peer = peer_id.clone();
        handles.push(tokio::spawn(async move {
            let response: HealthMsg = transport
                .send(&peer, ProtocolId::Health, &HealthMsg::Probe)
                .await
                .unwrap();
            matches!(response, HealthMsg::Pong { .. })
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }
}

#[tokio::test]
async fn test_unknown_peer_is_unreachable() {
    let a = start_transport("shared-secret").await;
    let err = a
        .transport
        .connect(&"ff".repeat(32))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Unreachable(_)));
}
