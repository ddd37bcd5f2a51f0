// src/core/transport/session.rs

//! A pooled, multiplexed peer session. One authenticated connection carries
//! any number of framed streams; a failure on one stream closes that stream
//! only, while the session survives until its consecutive-failure budget is
//! exhausted or the peer is declared down.

use crate::core::transport::framing::{MuxFrame, ProtocolId, from_wire, to_wire};
use crate::core::transport::stream::AnyStream;
use crate::core::{MeshError, NodeId};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

const OUTBOUND_QUEUE: usize = 64;
const STREAM_QUEUE: usize = 32;

/// A stream handed to a protocol handler by the accept side.
pub struct Incoming {
    pub peer_id: NodeId,
    pub protocol: ProtocolId,
    pub stream: PeerStream,
}

#[derive(Debug)]
pub struct Session {
    pub peer_id: NodeId,
    outbound: mpsc::Sender<MuxFrame>,
    streams: Arc<DashMap<u64, mpsc::Sender<Bytes>>>,
    next_stream_id: AtomicU64,
    consecutive_failures: AtomicU32,
    failure_limit: u32,
    closed: watch::Sender<bool>,
    last_used: parking_lot::Mutex<Instant>,
}

impl Session {
    /// Spawns the reader and writer tasks for an authenticated connection
    /// and returns the session handle.
    pub fn start(
        framed: Framed<AnyStream, LengthDelimitedCodec>,
        peer_id: NodeId,
        initiator: bool,
        incoming_tx: mpsc::Sender<Incoming>,
        failure_limit: u32,
    ) -> Arc<Self> {
        let (out_tx, mut out_rx) = mpsc::channel::<MuxFrame>(OUTBOUND_QUEUE);
        let streams: Arc<DashMap<u64, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
        let (closed_tx, mut writer_closed_rx) = watch::channel(false);
        let mut reader_closed_rx = closed_tx.subscribe();

        let session = Arc::new(Self {
            peer_id: peer_id.clone(),
            outbound: out_tx,
            streams: streams.clone(),
            // Initiator-opened streams are even, acceptor-opened odd.
            next_stream_id: AtomicU64::new(if initiator { 2 } else { 1 }),
            consecutive_failures: AtomicU32::new(0),
            failure_limit,
            closed: closed_tx,
            last_used: parking_lot::Mutex::new(Instant::now()),
        });

        let (mut sink, mut source) = framed.split();

        // Writer: drains the outbound queue into the framed sink until the
        // session closes.
        let writer_session = session.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    maybe = out_rx.recv() => match maybe {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = writer_closed_rx.changed() => break,
                };
                let bytes = match to_wire(&frame) {
                    Ok(b) => Bytes::from(b),
                    Err(e) => {
                        warn!("Failed to encode mux frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    debug!(
                        "Session to {} writer failed: {e}",
                        writer_session.peer_id
                    );
                    break;
                }
            }
            writer_session.close();
        });

        // Reader: demultiplexes frames onto per-stream queues. Awaiting a
        // full per-stream queue intentionally backpressures the whole
        // session; the upstream is only read as fast as consumers drain.
        let reader_session = session.clone();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    maybe = source.next() => match maybe {
                        Some(result) => result,
                        None => break,
                    },
                    _ = reader_closed_rx.changed() => break,
                };
                let frame: MuxFrame = match result {
                    Ok(bytes) => match from_wire(&bytes) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(
                                "Undecodable frame from {}: {e}",
                                reader_session.peer_id
                            );
                            continue;
                        }
                    },
                    Err(e) => {
                        debug!("Session to {} read failed: {e}", reader_session.peer_id);
                        break;
                    }
                };

                match frame {
                    MuxFrame::Open {
                        stream_id,
                        protocol,
                    } => {
                        let Some(protocol) = ProtocolId::from_u8(protocol) else {
                            reader_session.send_frame_best_effort(MuxFrame::Reset {
                                stream_id,
                                code: MeshError::InvalidRequest(String::new()).code(),
                            });
                            continue;
                        };
                        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
                        reader_session.streams.insert(stream_id, data_tx);
                        let incoming = Incoming {
                            peer_id: reader_session.peer_id.clone(),
                            protocol,
                            stream: PeerStream {
                                stream_id,
                                session: reader_session.clone(),
                                rx: data_rx,
                            },
                        };
                        if incoming_tx.try_send(incoming).is_err() {
                            reader_session.streams.remove(&stream_id);
                            reader_session.send_frame_best_effort(MuxFrame::Reset {
                                stream_id,
                                code: MeshError::Overloaded.code(),
                            });
                        }
                    }
                    MuxFrame::Data { stream_id, payload } => {
                        let tx = reader_session
                            .streams
                            .get(&stream_id)
                            .map(|entry| entry.value().clone());
                        if let Some(tx) = tx {
                            if tx.send(Bytes::from(payload)).await.is_err() {
                                reader_session.streams.remove(&stream_id);
                            }
                        }
                    }
                    MuxFrame::Close { stream_id } | MuxFrame::Reset { stream_id, .. } => {
                        reader_session.streams.remove(&stream_id);
                    }
                }
            }
            reader_session.close();
        });

        session
    }

    /// Opens a new bidirectional framed stream for the given protocol.
    pub async fn open_stream(self: &Arc<Self>, protocol: ProtocolId) -> Result<PeerStream, MeshError> {
        if self.is_closed() {
            return Err(MeshError::StreamClosed);
        }
        self.touch();
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
        self.streams.insert(stream_id, data_tx);
        if self
            .outbound
            .send(MuxFrame::Open {
                stream_id,
                protocol: protocol as u8,
            })
            .await
            .is_err()
        {
            self.streams.remove(&stream_id);
            return Err(MeshError::StreamClosed);
        }
        Ok(PeerStream {
            stream_id,
            session: self.clone(),
            rx: data_rx,
        })
    }

    fn send_frame_best_effort(&self, frame: MuxFrame) {
        let _ = self.outbound.try_send(frame);
    }

    async fn send_frame(&self, frame: MuxFrame) -> Result<(), MeshError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| MeshError::StreamClosed)
    }

    /// Records an application-level failure on this session. Returns true
    /// when the failure budget is exhausted and the session was torn down.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_limit {
            self.close();
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn close(&self) {
        if !*self.closed.borrow() {
            let _ = self.closed.send(true);
            self.streams.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// True when no streams are currently open; only idle sessions are
    /// eligible for pool eviction.
    pub fn is_idle(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }
}

/// One multiplexed record stream within a session. Records are opaque byte
/// payloads; protocols layer bincode messages on top via `send_msg` and
/// `recv_msg`.
pub struct PeerStream {
    pub stream_id: u64,
    session: Arc<Session>,
    rx: mpsc::Receiver<Bytes>,
}

/// Send-only handle to a stream, for tasks that write while another holds
/// the receiving half in a select arm.
#[derive(Clone)]
pub struct PeerStreamSender {
    stream_id: u64,
    session: Arc<Session>,
}

impl PeerStreamSender {
    pub async fn send(&self, payload: Bytes) -> Result<(), MeshError> {
        self.session
            .send_frame(MuxFrame::Data {
                stream_id: self.stream_id,
                payload: payload.to_vec(),
            })
            .await
    }

    pub async fn send_msg<T: bincode::enc::Encode>(&self, value: &T) -> Result<(), MeshError> {
        self.send(Bytes::from(to_wire(value)?)).await
    }
}

impl PeerStream {
    /// A detachable sender for this stream.
    pub fn sender(&self) -> PeerStreamSender {
        PeerStreamSender {
            stream_id: self.stream_id,
            session: self.session.clone(),
        }
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.session.peer_id
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), MeshError> {
        self.session
            .send_frame(MuxFrame::Data {
                stream_id: self.stream_id,
                payload: payload.to_vec(),
            })
            .await
    }

    /// Receives the next record, or `None` once the peer closed the stream.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub async fn send_msg<T: bincode::enc::Encode>(&self, value: &T) -> Result<(), MeshError> {
        self.send(Bytes::from(to_wire(value)?)).await
    }

    pub async fn recv_msg<T: bincode::de::Decode<()>>(&mut self) -> Result<T, MeshError> {
        match self.recv().await {
            Some(bytes) => from_wire(&bytes),
            None => Err(MeshError::StreamClosed),
        }
    }

    /// Closes this stream only; the session is unaffected.
    pub async fn close(&self) {
        let _ = self
            .session
            .send_frame(MuxFrame::Close {
                stream_id: self.stream_id,
            })
            .await;
    }
}

impl Drop for PeerStream {
    fn drop(&mut self) {
        self.session.streams.remove(&self.stream_id);
        self.session.send_frame_best_effort(MuxFrame::Close {
            stream_id: self.stream_id,
        });
    }
}
