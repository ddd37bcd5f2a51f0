// src/core/distribution/transfer.rs

//! The chunk-transfer stream protocol: the receiver asks for the chunks it
//! is missing, the sender streams them with their digests, the receiver
//! verifies each on arrival and the Merkle root at the end. Parallelism per
//! transfer is a bounded window of unacknowledged chunks.

use crate::core::distribution::cas::{ChunkStore, digest_of};
use crate::core::distribution::manifest;
use crate::core::state::types::{ModelRecord, NodeLifecycle, ReplicaStatus};
use crate::core::state::StateStore;
use crate::core::transport::{Incoming, PeerStream};
use crate::core::{MeshError, ModelId, NodeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum TransferFrame {
    /// Sent by the receiver: the chunks it still needs, as a bitset indexed by
    /// chunk number (LSB-first within each byte).
    Want { model: String, need: Vec<u8> },
    Chunk {
        index: u32,
        length: u32,
        digest: String,
        bytes: Vec<u8>,
    },
    Ack { index: u32 },
    End { root_digest: String },
    Error { code: u16, detail: String },
}

pub fn bitset_from_indexes(total: u32, wanted: &[u32]) -> Vec<u8> {
    let mut bits = vec![0u8; total.div_ceil(8) as usize];
    for &index in wanted {
        if index < total {
            bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
    bits
}

pub fn indexes_from_bitset(bits: &[u8], total: u32) -> Vec<u32> {
    (0..total)
        .filter(|index| {
            bits.get((index / 8) as usize)
                .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
        })
        .collect()
}

/// Serves outbound chunk transfers. One task per incoming stream; the
/// per-node outbound total is bounded by the semaphore.
pub struct TransferServer {
    node_id: NodeId,
    store: Arc<StateStore>,
    cas: Arc<ChunkStore>,
    outbound: Arc<Semaphore>,
    window: usize,
}

impl TransferServer {
    pub fn new(
        node_id: NodeId,
        store: Arc<StateStore>,
        cas: Arc<ChunkStore>,
        max_outbound: usize,
        window: usize,
    ) -> Self {
        Self {
            node_id,
            store,
            cas,
            outbound: Arc::new(Semaphore::new(max_outbound.max(1))),
            window: window.max(1),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut incoming_rx: mpsc::Receiver<Incoming>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Transfer server shutting down.");
                    return;
                }
                maybe = incoming_rx.recv() => {
                    let Some(incoming) = maybe else { return };
                    let server = self.clone();
                    tokio::spawn(async move {
                        let peer = incoming.peer_id.clone();
                        if let Err(e) = server.serve_stream(incoming.stream).await {
                            debug!("Transfer to {peer} ended with error: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn serve_stream(&self, mut stream: PeerStream) -> Result<(), MeshError> {
        let TransferFrame::Want { model, need } = stream.recv_msg().await? else {
            return Err(MeshError::InvalidRequest("expected Want frame".to_string()));
        };

        // Draining nodes stop being a source for new transfers.
        if self
            .store
            .node(&self.node_id)
            .is_some_and(|n| n.state == NodeLifecycle::Draining)
        {
            let e = MeshError::Draining;
            let _ = stream
                .send_msg(&TransferFrame::Error {
                    code: e.code(),
                    detail: e.to_string(),
                })
                .await;
            return Err(e);
        }

        let Some(record) = self.store.model(&model) else {
            let e = MeshError::NotFound(format!("model {model}"));
            let _ = stream
                .send_msg(&TransferFrame::Error {
                    code: e.code(),
                    detail: e.to_string(),
                })
                .await;
            return Err(e);
        };
        let have_ready = self
            .store
            .replica(&model, &self.node_id)
            .is_some_and(|r| r.status == ReplicaStatus::Ready);
        if !have_ready {
            let e = MeshError::SourceUnavailable(model.clone());
            let _ = stream
                .send_msg(&TransferFrame::Error {
                    code: e.code(),
                    detail: e.to_string(),
                })
                .await;
            return Err(e);
        }

        let Ok(_permit) = self.outbound.clone().try_acquire_owned() else {
            let e = MeshError::Overloaded;
            let _ = stream
                .send_msg(&TransferFrame::Error {
                    code: e.code(),
                    detail: "outbound transfer cap reached".to_string(),
                })
                .await;
            return Err(e);
        };

        let wanted = indexes_from_bitset(&need, record.chunks.len() as u32);
        debug!(
            "Serving {} of {} chunks of {model} to {}",
            wanted.len(),
            record.chunks.len(),
            stream.peer_id()
        );

        let mut unacked = 0usize;
        for index in wanted {
            let chunk = &record.chunks[index as usize];
            let Some(bytes) = self.cas.get_verified(&chunk.digest).await? else {
                let e = MeshError::IntegrityFailed {
                    model: model.clone(),
                    detail: format!("local chunk {index} missing"),
                };
                let _ = stream
                    .send_msg(&TransferFrame::Error {
                        code: e.code(),
                        detail: e.to_string(),
                    })
                    .await;
                return Err(e);
            };
            crate::core::metrics::TRANSFER_BYTES_OUT.inc_by(bytes.len() as f64);
            stream
                .send_msg(&TransferFrame::Chunk {
                    index,
                    length: bytes.len() as u32,
                    digest: chunk.digest.clone(),
                    bytes,
                })
                .await?;
            unacked += 1;
            while unacked >= self.window {
                match stream.recv_msg::<TransferFrame>().await? {
                    TransferFrame::Ack { .. } => unacked -= 1,
                    TransferFrame::Error { code, detail } => {
                        return Err(MeshError::from_code(code, &detail));
                    }
                    other => {
                        return Err(MeshError::InvalidRequest(format!(
                            "unexpected frame during transfer: {other:?}"
                        )));
                    }
                }
            }
        }
        while unacked > 0 {
            match stream.recv_msg::<TransferFrame>().await? {
                TransferFrame::Ack { .. } => unacked -= 1,
                TransferFrame::Error { code, detail } => {
                    return Err(MeshError::from_code(code, &detail));
                }
                other => {
                    return Err(MeshError::InvalidRequest(format!(
                        "unexpected frame during transfer: {other:?}"
                    )));
                }
            }
        }

        stream
            .send_msg(&TransferFrame::End {
                root_digest: record.root_digest.clone(),
            })
            .await?;
        Ok(())
    }
}

/// Fetches every missing chunk of `record` from `stream` into the local
/// store. Cancellation between chunks is clean: each stored chunk is
/// complete and content-addressed.
pub async fn fetch_missing(
    mut stream: PeerStream,
    record: &ModelRecord,
    cas: &ChunkStore,
    progress_bytes: &AtomicU64,
) -> Result<(), MeshError> {
    let total = record.chunks.len() as u32;
    let mut missing = Vec::new();
    for chunk in &record.chunks {
        if !cas.contains(&chunk.digest).await {
            missing.push(chunk.index);
        } else {
            progress_bytes.fetch_add(chunk.length as u64, Ordering::Relaxed);
        }
    }

    if !missing.is_empty() {
        stream
            .send_msg(&TransferFrame::Want {
                model: record.id.clone(),
                need: bitset_from_indexes(total, &missing),
            })
            .await?;

        let mut outstanding: HashSet<u32> = missing.into_iter().collect();
        while !outstanding.is_empty() {
            match stream.recv_msg::<TransferFrame>().await? {
                TransferFrame::Chunk {
                    index,
                    length,
                    digest,
                    bytes,
                } => {
                    let Some(expected) = record.chunks.get(index as usize) else {
                        return Err(MeshError::IntegrityFailed {
                            model: record.id.clone(),
                            detail: format!("unexpected chunk index {index}"),
                        });
                    };
                    if digest != expected.digest
                        || bytes.len() != length as usize
                        || digest_of(&bytes) != expected.digest
                    {
                        crate::core::metrics::INTEGRITY_FAILURES_TOTAL.inc();
                        let e = MeshError::IntegrityFailed {
                            model: record.id.clone(),
                            detail: format!("chunk {index} failed digest verification"),
                        };
                        let _ = stream
                            .send_msg(&TransferFrame::Error {
                                code: e.code(),
                                detail: e.to_string(),
                            })
                            .await;
                        return Err(e);
                    }
                    cas.put(&expected.digest, &bytes).await?;
                    crate::core::metrics::TRANSFER_BYTES_IN.inc_by(bytes.len() as f64);
                    progress_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    outstanding.remove(&index);
                    stream.send_msg(&TransferFrame::Ack { index }).await?;
                }
                TransferFrame::End { root_digest } => {
                    if !outstanding.is_empty() {
                        return Err(MeshError::IntegrityFailed {
                            model: record.id.clone(),
                            detail: format!(
                                "sender ended with {} chunks outstanding",
                                outstanding.len()
                            ),
                        });
                    }
                    return finish(record, &root_digest);
                }
                TransferFrame::Error { code, detail } => {
                    return Err(MeshError::from_code(code, &detail));
                }
                other => {
                    return Err(MeshError::InvalidRequest(format!(
                        "unexpected frame during fetch: {other:?}"
                    )));
                }
            }
        }

        // All chunks arrived; the sender owes us a final End frame.
        match stream.recv_msg::<TransferFrame>().await? {
            TransferFrame::End { root_digest } => return finish(record, &root_digest),
            TransferFrame::Error { code, detail } => {
                return Err(MeshError::from_code(code, &detail));
            }
            other => {
                return Err(MeshError::InvalidRequest(format!(
                    "expected End frame, got {other:?}"
                )));
            }
        }
    }

    // Nothing was missing; verify the root locally and skip the exchange.
    let root = manifest::merkle_root(&record.chunks);
    if root != record.root_digest {
        warn!("Local chunk set of {} fails root verification", record.id);
        return Err(MeshError::IntegrityFailed {
            model: record.id.clone(),
            detail: "root digest mismatch on locally-complete model".to_string(),
        });
    }
    Ok(())
}

fn finish(record: &ModelRecord, sender_root: &str) -> Result<(), MeshError> {
    let root = manifest::merkle_root(&record.chunks);
    if root != record.root_digest || sender_root != record.root_digest {
        crate::core::metrics::INTEGRITY_FAILURES_TOTAL.inc();
        return Err(MeshError::IntegrityFailed {
            model: record.id.clone(),
            detail: format!(
                "root digest mismatch: computed {root}, sender {sender_root}, descriptor {}",
                record.root_digest
            ),
        });
    }
    Ok(())
}

/// Book-keeping for the control API's transfer listing.
#[derive(Debug)]
pub struct TransferProgress {
    pub model: ModelId,
    pub source: NodeId,
    pub total_bytes: u64,
    pub bytes: AtomicU64,
    pub started_ms: u64,
}
