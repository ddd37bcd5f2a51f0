// src/core/transport/mod.rs

//! The peer-to-peer overlay: authenticated framed sessions, a bounded
//! connection pool, stream multiplexing, gossip, and discovery.

pub mod discovery;
pub mod framing;
pub mod gossip;
pub mod handshake;
pub mod session;
pub mod stream;
pub mod tls;

pub use framing::ProtocolId;
pub use session::{Incoming, PeerStream, Session};

use crate::config::TransportConfig;
use crate::core::identity::NodeIdentity;
use crate::core::transport::stream::AnyStream;
use crate::core::{MeshError, NodeId, now_ms};
use dashmap::DashMap;
use lru::LruCache;
use rustls::pki_types::ServerName;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

const INCOMING_QUEUE: usize = 256;

/// Everything this node knows about how to reach a peer.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub addrs: Vec<String>,
    pub gossip_addr: Option<SocketAddr>,
    pub last_seen_ms: u64,
}

pub struct Transport {
    identity: Arc<NodeIdentity>,
    cfg: TransportConfig,
    rendezvous: String,
    my_addrs: Vec<String>,
    my_gossip_addr: String,
    pool: parking_lot::Mutex<LruCache<NodeId, Arc<Session>>>,
    /// The peer address book, shared with gossip and discovery.
    pub peers: Arc<DashMap<NodeId, PeerInfo>>,
    deny: parking_lot::RwLock<HashSet<NodeId>>,
    dial_permits: Arc<Semaphore>,
    accept_permits: Arc<Semaphore>,
    incoming_tx: mpsc::Sender<Incoming>,
    handlers: DashMap<u8, mpsc::Sender<Incoming>>,
    tls_acceptor: Option<TlsAcceptor>,
    tls_connector: Option<TlsConnector>,
}

impl Transport {
    /// Builds the transport. The returned receiver carries every stream
    /// opened by peers and must be drained by `run_dispatcher`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<NodeIdentity>,
        cfg: TransportConfig,
        rendezvous: String,
        my_addrs: Vec<String>,
        my_gossip_addr: String,
        deny_list: Vec<NodeId>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> (Arc<Self>, mpsc::Receiver<Incoming>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let tls_connector = tls_acceptor.as_ref().map(|_| tls::build_connector());
        let transport = Arc::new(Self {
            identity,
            dial_permits: Arc::new(Semaphore::new(cfg.max_concurrent_dials)),
            accept_permits: Arc::new(Semaphore::new(cfg.accept_workers)),
            pool: parking_lot::Mutex::new(LruCache::unbounded()),
            peers: Arc::new(DashMap::new()),
            deny: parking_lot::RwLock::new(deny_list.into_iter().collect()),
            handlers: DashMap::new(),
            incoming_tx,
            rendezvous,
            my_addrs,
            my_gossip_addr,
            tls_acceptor,
            tls_connector,
            cfg,
        });
        (transport, incoming_rx)
    }

    pub fn local_id(&self) -> &NodeId {
        self.identity.id()
    }

    /// Registers the single handler for a stream protocol. Streams arriving
    /// for unregistered protocols are dropped.
    pub fn register_handler(
        &self,
        protocol: ProtocolId,
        capacity: usize,
    ) -> mpsc::Receiver<Incoming> {
        let (tx, rx) = mpsc::channel(capacity);
        self.handlers.insert(protocol as u8, tx);
        rx
    }

    /// Routes incoming streams to their protocol handlers. Handler queues
    /// are bounded; a full queue backpressures the session that opened the
    /// stream.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut incoming_rx: mpsc::Receiver<Incoming>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Transport dispatcher shutting down.");
                    return;
                }
                maybe = incoming_rx.recv() => {
                    let Some(incoming) = maybe else { return };
                    let Some(tx) = self
                        .handlers
                        .get(&(incoming.protocol as u8))
                        .map(|entry| entry.value().clone())
                    else {
                        debug!(
                            "No handler for protocol {} from {}; dropping stream",
                            incoming.protocol, incoming.peer_id
                        );
                        continue;
                    };
                    if tx.send(incoming).await.is_err() {
                        warn!("A protocol handler exited; its streams are being dropped");
                    }
                }
            }
        }
    }

    pub fn is_denied(&self, peer: &NodeId) -> bool {
        self.deny.read().contains(peer)
    }

    pub fn set_denied(&self, peer: NodeId, denied: bool) {
        let mut deny = self.deny.write();
        if denied {
            deny.insert(peer);
        } else {
            deny.remove(&peer);
        }
    }

    /// Records or refreshes a peer's reachable addresses.
    pub fn upsert_peer(&self, peer: &NodeId, addrs: Vec<String>, gossip_addr: Option<String>) {
        if *peer == *self.identity.id() {
            return;
        }
        let mut entry = self.peers.entry(peer.clone()).or_default();
        for addr in addrs {
            if !entry.addrs.contains(&addr) {
                entry.addrs.push(addr);
            }
        }
        if let Some(gossip) = gossip_addr.and_then(|a| a.parse().ok()) {
            entry.gossip_addr = Some(gossip);
        }
        entry.last_seen_ms = now_ms();
    }

    pub fn knows_addr(&self, addr: &str) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.value().addrs.iter().any(|a| a == addr))
    }

    fn pooled(&self, peer: &NodeId) -> Option<Arc<Session>> {
        let mut pool = self.pool.lock();
        match pool.get(peer) {
            Some(session) if !session.is_closed() => {
                session.touch();
                Some(session.clone())
            }
            Some(_) => {
                pool.pop(peer);
                None
            }
            None => None,
        }
    }

    pub fn drop_session(&self, peer: &NodeId) {
        if let Some(session) = self.pool.lock().pop(peer) {
            session.close();
        }
        crate::core::metrics::PEER_SESSIONS.set(self.pool.lock().len() as i64);
    }

    fn admit_session(&self, session: Arc<Session>) {
        let mut pool = self.pool.lock();
        if let Some(old) = pool.put(session.peer_id.clone(), session) {
            // At most one live session per peer; the replaced one drains
            // its open streams and dies.
            if old.is_idle() {
                old.close();
            }
        }
        // Evict least-recently-used idle sessions beyond the cap. Busy
        // sessions are skipped and re-inserted.
        let mut busy = Vec::new();
        while pool.len() > self.cfg.max_sessions {
            let Some((peer, session)) = pool.pop_lru() else {
                break;
            };
            if session.is_idle() {
                session.close();
            } else {
                busy.push((peer, session));
            }
            if pool.len() + busy.len() <= self.cfg.max_sessions {
                break;
            }
        }
        for (peer, session) in busy {
            pool.put(peer, session);
        }
        crate::core::metrics::PEER_SESSIONS.set(pool.len() as i64);
    }

    /// Returns the pooled session for a peer, dialing one if needed. Fails
    /// with `Unreachable`, `AuthFailed`, or `Timeout`.
    pub async fn connect(&self, peer: &NodeId) -> Result<Arc<Session>, MeshError> {
        if *peer == *self.identity.id() {
            return Err(MeshError::Internal("refusing to dial self".to_string()));
        }
        if self.is_denied(peer) {
            return Err(MeshError::AuthFailed(format!("peer {peer} is denied")));
        }
        if let Some(session) = self.pooled(peer) {
            return Ok(session);
        }

        let addrs = self
            .peers
            .get(peer)
            .map(|entry| entry.value().addrs.clone())
            .unwrap_or_default();
        if addrs.is_empty() {
            return Err(MeshError::Unreachable(format!(
                "no known address for {peer}"
            )));
        }

        let _permit = self
            .dial_permits
            .acquire()
            .await
            .map_err(|_| MeshError::Internal("dial semaphore closed".to_string()))?;
        // Another task may have finished dialing while we waited.
        if let Some(session) = self.pooled(peer) {
            return Ok(session);
        }

        let mut last_err = MeshError::Unreachable(format!("all addresses failed for {peer}"));
        for addr in &addrs {
            match self.dial(addr, Some(peer)).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    debug!("Dial {addr} for {peer} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Dials an address whose node identity is not yet known; used by
    /// discovery. The handshake still authenticates whoever answers.
    pub async fn connect_addr(&self, addr: &str) -> Result<Arc<Session>, MeshError> {
        let _permit = self
            .dial_permits
            .acquire()
            .await
            .map_err(|_| MeshError::Internal("dial semaphore closed".to_string()))?;
        self.dial(addr, None).await
    }

    async fn dial(&self, addr: &str, expected: Option<&NodeId>) -> Result<Arc<Session>, MeshError> {
        let timeout = Duration::from_millis(self.cfg.connect_timeout_ms);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::Timeout(format!("dial {addr}")))?
            .map_err(|e| MeshError::Unreachable(format!("{addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);

        let stream = match &self.tls_connector {
            Some(connector) => {
                // Certificate identity is irrelevant here; the in-channel
                // handshake authenticates the node key.
                let name = ServerName::try_from("infermesh.peer")
                    .map_err(|_| MeshError::Internal("bad TLS server name".to_string()))?;
                let tls = tokio::time::timeout(timeout, connector.connect(name, tcp))
                    .await
                    .map_err(|_| MeshError::Timeout(format!("tls {addr}")))?
                    .map_err(|e| MeshError::Unreachable(format!("tls {addr}: {e}")))?;
                AnyStream::TlsClient(Box::new(tls))
            }
            None => AnyStream::Tcp(tcp),
        };

        let mut framed = framing::framed(stream, self.cfg.max_frame_bytes);
        let hello = tokio::time::timeout(
            timeout,
            handshake::run(
                &mut framed,
                &self.identity,
                &self.rendezvous,
                &self.my_addrs,
                &self.my_gossip_addr,
                expected,
                |peer| self.is_denied(peer),
                true,
            ),
        )
        .await
        .map_err(|_| MeshError::Timeout(format!("handshake with {addr}")))??;

        self.upsert_peer(
            &hello.node_id,
            hello.addrs.clone(),
            Some(hello.gossip_addr.clone()),
        );
        let session = Session::start(
            framed,
            hello.node_id.clone(),
            true,
            self.incoming_tx.clone(),
            self.cfg.session_failure_limit,
        );
        self.admit_session(session.clone());
        Ok(session)
    }

    /// Convenience single request/response exchange over a fresh stream.
    pub async fn send<Req, Resp>(
        &self,
        peer: &NodeId,
        protocol: ProtocolId,
        request: &Req,
    ) -> Result<Resp, MeshError>
    where
        Req: bincode::enc::Encode,
        Resp: bincode::de::Decode<()>,
    {
        let session = self.connect(peer).await?;
        let exchange = async {
            let mut stream = session.open_stream(protocol).await?;
            stream.send_msg(request).await?;
            stream.recv_msg::<Resp>().await
        };
        let timeout = Duration::from_millis(self.cfg.request_timeout_ms);
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(resp)) => {
                session.record_success();
                Ok(resp)
            }
            Ok(Err(e)) => {
                if session.record_failure() {
                    self.drop_session(peer);
                }
                Err(e)
            }
            Err(_) => {
                if session.record_failure() {
                    self.drop_session(peer);
                }
                Err(MeshError::Timeout(format!("{protocol} request to {peer}")))
            }
        }
    }

    /// Accept loop for the peer listener. Each connection is handshaked on
    /// a bounded worker before its session joins the pool.
    pub async fn run_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!(
            "Peer transport listening on {:?}",
            listener.local_addr().ok()
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Peer listener shutting down.");
                    return;
                }
                accepted = listener.accept() => {
                    let (tcp, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Peer accept failed: {e}");
                            continue;
                        }
                    };
                    let Ok(permit) = self.accept_permits.clone().acquire_owned().await else {
                        return;
                    };
                    let transport = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = transport.handle_inbound(tcp).await {
                            debug!("Inbound connection from {addr} rejected: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, tcp: TcpStream) -> Result<(), MeshError> {
        let _ = tcp.set_nodelay(true);
        let timeout = Duration::from_millis(self.cfg.connect_timeout_ms);
        let stream = match &self.tls_acceptor {
            Some(acceptor) => {
                let tls = tokio::time::timeout(timeout, acceptor.accept(tcp))
                    .await
                    .map_err(|_| MeshError::Timeout("tls accept".to_string()))?
                    .map_err(|e| MeshError::AuthFailed(format!("tls accept: {e}")))?;
                AnyStream::TlsServer(Box::new(tls))
            }
            None => AnyStream::Tcp(tcp),
        };

        let mut framed = framing::framed(stream, self.cfg.max_frame_bytes);
        let hello = tokio::time::timeout(
            timeout,
            handshake::run(
                &mut framed,
                &self.identity,
                &self.rendezvous,
                &self.my_addrs,
                &self.my_gossip_addr,
                None,
                |peer| self.is_denied(peer),
                false,
            ),
        )
        .await
        .map_err(|_| MeshError::Timeout("inbound handshake".to_string()))??;

        self.upsert_peer(
            &hello.node_id,
            hello.addrs.clone(),
            Some(hello.gossip_addr.clone()),
        );
        let session = Session::start(
            framed,
            hello.node_id.clone(),
            false,
            self.incoming_tx.clone(),
            self.cfg.session_failure_limit,
        );
        self.admit_session(session);
        debug!("Accepted peer session from {}", hello.node_id);
        Ok(())
    }
}
