use dashmap::DashMap;
use infermesh::core::transport::PeerInfo;
use infermesh::core::transport::gossip::{GossipService, GossipTopic};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct TestBus {
    gossip: Arc<GossipService>,
    peers: Arc<DashMap<String, PeerInfo>>,
    addr: std::net::SocketAddr,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn start_bus(node_id: &str, rendezvous: &str) -> TestBus {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let peers: Arc<DashMap<String, PeerInfo>> = Arc::new(DashMap::new());
    let gossip = Arc::new(GossipService::new(
        socket,
        node_id.to_string(),
        rendezvous.to_string(),
        peers.clone(),
        50,
        4096,
        30_000,
    ));
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(gossip.clone().run(shutdown_tx.subscribe()));
    TestBus {
        gossip,
        peers,
        addr,
        _shutdown_tx: shutdown_tx,
    }
}

fn link(from: &TestBus, to_id: &str, to: &TestBus) {
    from.peers.insert(
        to_id.to_string(),
        PeerInfo {
            addrs: Vec::new(),
            gossip_addr: Some(to.addr),
            last_seen_ms: 0,
        },
    );
}

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let a = start_bus("node-a", "secret").await;
    let b = start_bus("node-b", "secret").await;
    link(&a, "node-b", &b);

    let mut rx = b.gossip.subscribe(GossipTopic::Heartbeat);
    a.gossip
        .publish(GossipTopic::Heartbeat, b"beat".to_vec())
        .await
        .unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.from, "node-a");
    assert_eq!(&inbound.payload[..], b"beat");
}

#[tokio::test]
async fn test_topics_are_isolated() {
    let a = start_bus("node-a", "secret").await;
    let b = start_bus("node-b", "secret").await;
    link(&a, "node-b", &b);

    let mut hb_rx = b.gossip.subscribe(GossipTopic::Heartbeat);
    let mut suspect_rx = b.gossip.subscribe(GossipTopic::SuspectReport);

    a.gossip
        .publish(GossipTopic::SuspectReport, b"who".to_vec())
        .await
        .unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(2), suspect_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&inbound.payload[..], b"who");
    assert!(
        tokio::time::timeout(Duration::from_millis(300), hb_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_wrong_rendezvous_is_dropped() {
    let a = start_bus("node-a", "secret-one").await;
    let b = start_bus("node-b", "secret-two").await;
    link(&a, "node-b", &b);

    let mut rx = b.gossip.subscribe(GossipTopic::Heartbeat);
    a.gossip
        .publish(GossipTopic::Heartbeat, b"forged".to_vec())
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_oversized_payload_is_refused_at_publish() {
    let a = start_bus("node-a", "secret").await;
    let err = a
        .gossip
        .publish(GossipTopic::Heartbeat, vec![0u8; 64 * 1024])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds"));
}

#[tokio::test]
async fn test_direct_send_reaches_unlinked_peer() {
    let a = start_bus("node-a", "secret").await;
    let b = start_bus("node-b", "secret").await;
    // No link: the address book is empty, but a directed probe still lands.
    let mut rx = b.gossip.subscribe(GossipTopic::PeerAnnounce);
    a.gossip
        .send_to(b.addr, GossipTopic::PeerAnnounce, b"hello".to_vec())
        .await
        .unwrap();
    let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&inbound.payload[..], b"hello");
}
