// src/core/raft/net.rs

//! Wires the consensus core to the peer transport: outbound RPCs go through
//! `Transport::send`, inbound `raft` streams are decoded and answered by
//! the service loop.

use crate::core::raft::Raft;
use crate::core::raft::msg::{RaftRpc, RaftRpcResponse};
use crate::core::transport::{Incoming, ProtocolId, Transport};
use crate::core::{MeshError, NodeId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// How the consensus core reaches its peers.
#[async_trait]
pub trait RaftNetwork: Send + Sync {
    async fn send(&self, to: &NodeId, rpc: RaftRpc) -> Result<RaftRpcResponse, MeshError>;
}

pub struct TransportRaftNetwork {
    transport: Arc<Transport>,
}

impl TransportRaftNetwork {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl RaftNetwork for TransportRaftNetwork {
    async fn send(&self, to: &NodeId, rpc: RaftRpc) -> Result<RaftRpcResponse, MeshError> {
        self.transport.send(to, ProtocolId::Raft, &rpc).await
    }
}

/// Serves inbound `raft` protocol streams. Each stream carries one or more
/// request/response exchanges from a single peer.
pub async fn run_raft_service(
    raft: Raft,
    mut incoming_rx: mpsc::Receiver<Incoming>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Raft RPC service shutting down.");
                return;
            }
            maybe = incoming_rx.recv() => {
                let Some(incoming) = maybe else { return };
                let raft = raft.clone();
                tokio::spawn(async move {
                    let peer = incoming.peer_id;
                    let mut stream = incoming.stream;
                    loop {
                        let rpc: RaftRpc = match stream.recv_msg().await {
                            Ok(rpc) => rpc,
                            Err(MeshError::StreamClosed) => break,
                            Err(e) => {
                                debug!("Bad raft frame from {peer}: {e}");
                                break;
                            }
                        };
                        let response = raft.rpc(peer.clone(), rpc).await;
                        if stream.send_msg(&response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    }
}
