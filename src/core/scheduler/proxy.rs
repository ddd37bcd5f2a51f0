// src/core/scheduler/proxy.rs

//! The scheduler-proxy stream protocol: one request frame, then a streamed
//! response relayed transparently. Backpressure is end-to-end: the engine
//! response is only read as fast as the downstream consumes body frames.

use crate::core::engine::EngineClient;
use crate::core::scheduler::lease::{LeaseGuard, NodeLoads};
use crate::core::state::StateStore;
use crate::core::state::types::NodeLifecycle;
use crate::core::transport::{Incoming, PeerStream, ProtocolId, Transport};
use crate::core::{MeshError, NodeId, now_ms};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Absolute client deadline, epoch milliseconds; 0 means none.
    pub deadline_ms: u64,
}

#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum ProxyFrame {
    Status {
        code: u16,
        headers: Vec<(String, String)>,
    },
    Body {
        bytes: Vec<u8>,
    },
    End,
    Error {
        code: u16,
        detail: String,
    },
    Cancel,
}

/// The target side: relays proxied requests into the local engine.
pub struct ProxyServer {
    node_id: NodeId,
    engine: Arc<EngineClient>,
    store: Arc<StateStore>,
    loads: Arc<NodeLoads>,
}

impl ProxyServer {
    pub fn new(
        node_id: NodeId,
        engine: Arc<EngineClient>,
        store: Arc<StateStore>,
        loads: Arc<NodeLoads>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            engine,
            store,
            loads,
        })
    }

    pub async fn run(
        self: Arc<Self>,
        mut incoming_rx: mpsc::Receiver<Incoming>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Proxy server shutting down.");
                    return;
                }
                maybe = incoming_rx.recv() => {
                    let Some(incoming) = maybe else { return };
                    let server = self.clone();
                    tokio::spawn(async move {
                        let peer = incoming.peer_id.clone();
                        if let Err(e) = server.serve_stream(incoming.stream).await {
                            debug!("Proxied call from {peer} ended: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn serve_stream(&self, mut stream: PeerStream) -> Result<(), MeshError> {
        let request: ProxyRequest = stream.recv_msg().await?;
        let sender = stream.sender();

        // Draining nodes refuse new work but finish what they hold.
        if self
            .store
            .node(&self.node_id)
            .is_some_and(|n| n.state == NodeLifecycle::Draining)
        {
            let e = MeshError::Draining;
            let _ = sender
                .send_msg(&ProxyFrame::Error {
                    code: e.code(),
                    detail: e.to_string(),
                })
                .await;
            return Err(e);
        }

        // The target's own lease: released when the relay finishes.
        let mut lease = LeaseGuard::acquire(self.loads.get(&self.node_id), self.node_id.clone());

        let remaining = if request.deadline_ms > 0 {
            let now = now_ms();
            if now >= request.deadline_ms {
                let e = MeshError::DeadlineExceeded;
                let _ = sender
                    .send_msg(&ProxyFrame::Error {
                        code: e.code(),
                        detail: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
            Some(Duration::from_millis(request.deadline_ms - now))
        } else {
            None
        };

        let call = self
            .engine
            .infer(&request.path, Bytes::from(request.body.clone()));
        let response = match remaining {
            Some(budget) => match tokio::time::timeout(budget, call).await {
                Ok(result) => result,
                Err(_) => Err(MeshError::EngineTimeout),
            },
            None => call.await,
        };

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                let _ = sender
                    .send_msg(&ProxyFrame::Error {
                        code: e.code(),
                        detail: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        sender
            .send_msg(&ProxyFrame::Status {
                code: response.status().as_u16(),
                headers,
            })
            .await?;

        // Relay body chunks until the engine finishes or the origin cancels
        // (an explicit Cancel frame or the stream closing under us).
        let mut body = response.bytes_stream();
        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        sender
                            .send_msg(&ProxyFrame::Body {
                                bytes: bytes.to_vec(),
                            })
                            .await?;
                    }
                    Some(Err(e)) => {
                        let e: MeshError = e.into();
                        let _ = sender
                            .send_msg(&ProxyFrame::Error {
                                code: e.code(),
                                detail: e.to_string(),
                            })
                            .await;
                        lease.release();
                        return Err(e);
                    }
                    None => break,
                },
                frame = stream.recv() => match frame {
                    Some(bytes) => {
                        if let Ok(ProxyFrame::Cancel) =
                            crate::core::transport::framing::from_wire::<ProxyFrame>(&bytes)
                        {
                            debug!("Origin cancelled proxied call; aborting engine stream");
                            lease.release();
                            return Ok(());
                        }
                    }
                    None => {
                        // Origin went away; dropping the engine response
                        // aborts the call best-effort.
                        lease.release();
                        return Ok(());
                    }
                },
            }
        }

        sender.send_msg(&ProxyFrame::End).await?;
        lease.release();
        Ok(())
    }
}

/// A proxied response as seen by the origin scheduler.
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: super::ServeBody,
}

/// Origin side: opens a scheduler-proxy stream to `target` and relays the
/// request, returning the streamed response.
pub async fn proxy_call(
    transport: &Transport,
    target: &NodeId,
    request: ProxyRequest,
) -> Result<ProxyResponse, MeshError> {
    let session = transport.connect(target).await?;
    let mut stream = session.open_stream(ProtocolId::SchedulerProxy).await?;
    stream.send_msg(&request).await?;

    let (status, headers) = match stream.recv_msg::<ProxyFrame>().await? {
        ProxyFrame::Status { code, headers } => (code, headers),
        ProxyFrame::Error { code, detail } => {
            return Err(MeshError::from_code(code, &detail));
        }
        other => {
            return Err(MeshError::Codec(format!(
                "expected Status frame, got {other:?}"
            )));
        }
    };

    let body = Box::pin(async_stream::try_stream! {
        loop {
            match stream.recv_msg::<ProxyFrame>().await {
                Ok(ProxyFrame::Body { bytes }) => yield Bytes::from(bytes),
                Ok(ProxyFrame::End) => break,
                Ok(ProxyFrame::Error { code, detail }) => {
                    Err(MeshError::from_code(code, &detail))?;
                }
                Ok(other) => {
                    Err(MeshError::Codec(format!(
                        "unexpected proxy frame: {other:?}"
                    )))?;
                }
                // The stream dying mid-response surfaces as a partial-
                // response error; the scheduler never retries here.
                Err(_) => Err(MeshError::StreamClosed)?,
            }
        }
    });

    Ok(ProxyResponse {
        status,
        headers,
        body,
    })
}
