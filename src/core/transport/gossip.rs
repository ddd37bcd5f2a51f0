// src/core/transport/gossip.rs

//! Best-effort gossip over the UDP cluster bus. Messages are small (a few
//! kilobytes), unordered, delivered at-least-once within a bounded window,
//! and signed with an HMAC keyed by the shared rendezvous string.

use crate::core::transport::PeerInfo;
use crate::core::transport::framing::{from_wire, to_wire};
use crate::core::{MeshError, NodeId, now_ms};
use bytes::Bytes;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use lru::LruCache;
use sha2::Sha256;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const UDP_BUFFER_SIZE: usize = 65535;
const SEEN_CACHE_SIZE: usize = 4096;

/// Topics carried on the gossip bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GossipTopic {
    Heartbeat = 1,
    PeerAnnounce = 2,
    SuspectReport = 3,
}

impl GossipTopic {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(GossipTopic::Heartbeat),
            2 => Some(GossipTopic::PeerAnnounce),
            3 => Some(GossipTopic::SuspectReport),
            _ => None,
        }
    }
}

#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
struct Envelope {
    origin: String,
    seq: u64,
    topic: u8,
    timestamp_ms: u64,
    payload: Vec<u8>,
}

/// The structure actually sent over UDP: an envelope plus its signature.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
struct SignedEnvelope {
    envelope: Envelope,
    signature: [u8; 32],
}

fn sign_envelope(envelope: &Envelope, rendezvous: &str) -> Result<[u8; 32], MeshError> {
    let bytes = to_wire(envelope)?;
    let mut mac = HmacSha256::new_from_slice(rendezvous.as_bytes())
        .map_err(|_| MeshError::Internal("HMAC key setup failed".to_string()))?;
    mac.update(&bytes);
    let out = mac.finalize().into_bytes();
    out.as_slice()
        .try_into()
        .map_err(|_| MeshError::Internal("HMAC output length".to_string()))
}

fn verify_envelope(signed: &SignedEnvelope, rendezvous: &str) -> bool {
    match sign_envelope(&signed.envelope, rendezvous) {
        Ok(expected) => expected == signed.signature,
        Err(_) => false,
    }
}

/// A message delivered to a topic subscriber.
#[derive(Debug, Clone)]
pub struct GossipInbound {
    pub from: NodeId,
    pub payload: Bytes,
    pub timestamp_ms: u64,
}

pub struct GossipService {
    socket: Arc<UdpSocket>,
    node_id: NodeId,
    rendezvous: String,
    seq: AtomicU64,
    subs: DashMap<u8, Vec<mpsc::Sender<GossipInbound>>>,
    peers: Arc<DashMap<NodeId, PeerInfo>>,
    event_buffer: usize,
    max_payload: usize,
    /// Messages older than this are dropped as stale.
    stale_window_ms: u64,
    seen: parking_lot::Mutex<LruCache<(NodeId, u64), ()>>,
}

impl GossipService {
    pub fn new(
        socket: UdpSocket,
        node_id: NodeId,
        rendezvous: String,
        peers: Arc<DashMap<NodeId, PeerInfo>>,
        event_buffer: usize,
        max_payload: usize,
        stale_window_ms: u64,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            node_id,
            rendezvous,
            seq: AtomicU64::new(1),
            subs: DashMap::new(),
            peers,
            event_buffer,
            max_payload,
            stale_window_ms,
            seen: parking_lot::Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_SIZE).unwrap(),
            )),
        }
    }

    /// Registers a subscriber for a topic. Queues are bounded; when one is
    /// full, delivery falls back to a synchronous send so buffering can
    /// never grow without bound.
    pub fn subscribe(&self, topic: GossipTopic) -> mpsc::Receiver<GossipInbound> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        self.subs.entry(topic as u8).or_default().push(tx);
        rx
    }

    /// Publishes a message to every known peer's gossip address.
    pub async fn publish(&self, topic: GossipTopic, payload: Vec<u8>) -> Result<(), MeshError> {
        if payload.len() > self.max_payload {
            return Err(MeshError::InvalidRequest(format!(
                "gossip payload of {} bytes exceeds cap {}",
                payload.len(),
                self.max_payload
            )));
        }
        let envelope = Envelope {
            origin: self.node_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            topic: topic as u8,
            timestamp_ms: now_ms(),
            payload,
        };
        let signed = SignedEnvelope {
            signature: sign_envelope(&envelope, &self.rendezvous)?,
            envelope,
        };
        let bytes = to_wire(&signed)?;

        let targets: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter_map(|entry| entry.value().gossip_addr)
            .collect();
        for addr in targets {
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                debug!("Failed to send gossip to {addr}: {e}");
            }
        }
        Ok(())
    }

    /// Sends a message to one explicit address; used by discovery probes
    /// before the peer is in the address book.
    pub async fn send_to(
        &self,
        addr: SocketAddr,
        topic: GossipTopic,
        payload: Vec<u8>,
    ) -> Result<(), MeshError> {
        let envelope = Envelope {
            origin: self.node_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            topic: topic as u8,
            timestamp_ms: now_ms(),
            payload,
        };
        let signed = SignedEnvelope {
            signature: sign_envelope(&envelope, &self.rendezvous)?,
            envelope,
        };
        self.socket.send_to(&to_wire(&signed)?, addr).await?;
        Ok(())
    }

    /// The receive loop for the gossip bus.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Gossip bus listening on {:?}", self.socket.local_addr().ok());
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Gossip bus shutting down.");
                    return;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                        Err(e) => warn!("Error receiving from gossip bus: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], src: SocketAddr) {
        let signed: SignedEnvelope = match from_wire(bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to decode gossip datagram from {src}: {e}");
                return;
            }
        };
        if !verify_envelope(&signed, &self.rendezvous) {
            crate::core::metrics::GOSSIP_REJECTED_TOTAL.inc();
            warn!("Gossip message with invalid signature from {src}. Ignoring.");
            return;
        }
        let envelope = signed.envelope;
        if envelope.origin == self.node_id {
            return;
        }

        let now = now_ms();
        let age = now.abs_diff(envelope.timestamp_ms);
        if age > self.stale_window_ms {
            crate::core::metrics::GOSSIP_REJECTED_TOTAL.inc();
            debug!(
                "Dropping stale gossip from {}: {}ms out of window",
                envelope.origin, age
            );
            return;
        }

        // At-least-once delivery means duplicates; the seen cache keeps
        // them from reaching subscribers twice.
        {
            let mut seen = self.seen.lock();
            if seen
                .put((envelope.origin.clone(), envelope.seq), ())
                .is_some()
            {
                return;
            }
        }

        let Some(topic) = GossipTopic::from_u8(envelope.topic) else {
            debug!("Unknown gossip topic {} from {}", envelope.topic, envelope.origin);
            return;
        };

        let inbound = GossipInbound {
            from: envelope.origin,
            payload: Bytes::from(envelope.payload),
            timestamp_ms: envelope.timestamp_ms,
        };

        let senders: Vec<mpsc::Sender<GossipInbound>> = self
            .subs
            .get(&(topic as u8))
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for tx in senders {
            match tx.try_send(inbound.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    // Bounded queue is full: deliver synchronously rather
                    // than buffer without bound.
                    let _ = tx.send(msg).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.prune_closed(topic);
                }
            }
        }
    }

    fn prune_closed(&self, topic: GossipTopic) {
        if let Some(mut entry) = self.subs.get_mut(&(topic as u8)) {
            entry.value_mut().retain(|tx| !tx.is_closed());
        }
    }
}
