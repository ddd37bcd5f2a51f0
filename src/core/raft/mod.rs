// src/core/raft/mod.rs

//! Leader-based replicated log driving a deterministic key/value state
//! machine. Other components interact through the [`Raft`] handle (local
//! node) or the [`Proposer`] (cluster-wide: follower writes are forwarded
//! to the leader).

pub mod msg;
pub mod net;
pub mod node;
pub mod storage;

pub use msg::{
    Entry, HardState, LogRecord, Membership, MembershipOp, RaftRole, RaftRpc, RaftRpcResponse,
    RaftStatus,
};
pub use storage::{LogStore, SnapshotMeta};

use crate::config::RaftConfig;
use crate::core::raft::net::RaftNetwork;
use crate::core::raft::node::{RaftMsg, RaftNode};
use crate::core::transport::{ProtocolId, Transport};
use crate::core::{MeshError, NodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// The deterministic function applied to every committed record, in log
/// order. Implementations must never block: the consensus loop calls
/// `apply` inline.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, entry: &Entry);
    fn snapshot(&self) -> Result<Vec<u8>, MeshError>;
    fn restore(&self, data: &[u8]) -> Result<(), MeshError>;
}

/// Server-side proposal validation, run on the leader before a record is
/// appended. Receives the proposing node's authenticated identity.
pub type ProposalValidator =
    Arc<dyn Fn(&LogRecord, &NodeId) -> Result<(), MeshError> + Send + Sync>;

const API_QUEUE: usize = 256;

/// Cloneable handle to the local consensus core.
#[derive(Clone)]
pub struct Raft {
    id: NodeId,
    api_tx: mpsc::Sender<RaftMsg>,
    status_rx: watch::Receiver<RaftStatus>,
    commit_timeout: Duration,
}

impl Raft {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RaftStatus> {
        self.status_rx.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status_rx.borrow().is_leader()
    }

    /// Leader-only write. Resolves with the applied index on commit, or
    /// fails with `NotLeader`, `CommitTimeout`, or `Aborted`.
    pub async fn propose(&self, record: LogRecord) -> Result<u64, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(RaftMsg::Propose {
                record,
                proposer: self.id.clone(),
                tx,
            })
            .await
            .map_err(|_| MeshError::Aborted)?;
        match tokio::time::timeout(self.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::Aborted),
            Err(_) => Err(MeshError::CommitTimeout),
        }
    }

    /// Leader-only read-index barrier. The returned index is safe to read
    /// at once the local state machine has applied up to it.
    pub async fn read_barrier(&self) -> Result<u64, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(RaftMsg::ReadBarrier { tx })
            .await
            .map_err(|_| MeshError::Aborted)?;
        match tokio::time::timeout(self.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::Aborted),
            Err(_) => Err(MeshError::CommitTimeout),
        }
    }

    /// Single-server membership change; one in flight at a time.
    pub async fn change_membership(&self, op: MembershipOp) -> Result<u64, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(RaftMsg::ChangeMembership { op, tx })
            .await
            .map_err(|_| MeshError::Aborted)?;
        match tokio::time::timeout(self.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::Aborted),
            Err(_) => Err(MeshError::CommitTimeout),
        }
    }

    /// Forces a snapshot of the local state machine.
    pub async fn trigger_snapshot(&self) -> Result<u64, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(RaftMsg::TriggerSnapshot { tx })
            .await
            .map_err(|_| MeshError::Aborted)?;
        rx.await.map_err(|_| MeshError::Aborted)?
    }

    /// Dispatches an RPC received from a peer into the core.
    pub async fn rpc(&self, from: NodeId, rpc: RaftRpc) -> RaftRpcResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .api_tx
            .send(RaftMsg::Rpc { from, rpc, tx })
            .await
            .is_err()
        {
            return RaftRpcResponse::Error {
                code: MeshError::Aborted.code(),
                detail: "consensus core stopped".to_string(),
            };
        }
        rx.await.unwrap_or(RaftRpcResponse::Error {
            code: MeshError::Aborted.code(),
            detail: "consensus core dropped the request".to_string(),
        })
    }
}

/// Builds the consensus core and returns its handle plus the task that must
/// be spawned into the server's background set.
#[allow(clippy::too_many_arguments)]
pub fn build(
    id: NodeId,
    cfg: RaftConfig,
    store: LogStore,
    network: Arc<dyn RaftNetwork>,
    sm: Arc<dyn StateMachine>,
    validator: Option<ProposalValidator>,
    bootstrap: bool,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(Raft, JoinHandle<()>), MeshError> {
    let (api_tx, rx_api) = mpsc::channel(API_QUEUE);
    let (status_tx, status_rx) = watch::channel(RaftStatus::default());
    let commit_timeout = Duration::from_millis(cfg.commit_timeout_ms);

    let node = RaftNode::new(
        id.clone(),
        cfg,
        store,
        network,
        sm,
        validator,
        rx_api,
        api_tx.clone(),
        status_tx,
        bootstrap,
    )?;
    let handle = tokio::spawn(node.run(shutdown_rx));

    Ok((
        Raft {
            id,
            api_tx,
            status_rx,
            commit_timeout,
        },
        handle,
    ))
}

const FORWARD_RETRIES: u32 = 3;
const LEADER_WAIT: Duration = Duration::from_millis(150);

/// Cluster-wide write and linearizable-read client. Writes from a follower
/// are forwarded to the current leader over the transport; `not-leader`
/// redirects are chased a bounded number of times.
#[derive(Clone)]
pub struct Proposer {
    raft: Raft,
    transport: Arc<Transport>,
}

impl Proposer {
    pub fn new(raft: Raft, transport: Arc<Transport>) -> Self {
        Self { raft, transport }
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub async fn propose(&self, record: LogRecord) -> Result<u64, MeshError> {
        let mut last_err = MeshError::NotLeader(None);
        for _ in 0..FORWARD_RETRIES {
            match self.raft.propose(record.clone()).await {
                Ok(index) => return Ok(index),
                Err(MeshError::NotLeader(Some(leader))) => {
                    match self.forward(&leader, record.clone()).await {
                        Ok(index) => return Ok(index),
                        Err(e @ MeshError::NotLeader(_)) => {
                            last_err = e;
                            tokio::time::sleep(LEADER_WAIT).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(MeshError::NotLeader(None)) => {
                    last_err = MeshError::NotLeader(None);
                    tokio::time::sleep(LEADER_WAIT).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn forward(&self, leader: &NodeId, record: LogRecord) -> Result<u64, MeshError> {
        let rpc = RaftRpc::ForwardPropose {
            record,
            proposer: self.raft.id().clone(),
        };
        let response: RaftRpcResponse = self
            .transport
            .send(leader, ProtocolId::Raft, &rpc)
            .await?;
        match response {
            RaftRpcResponse::Propose { result } => {
                result.map_err(|(code, detail)| MeshError::from_code(code, &detail))
            }
            RaftRpcResponse::Error { code, detail } => Err(MeshError::from_code(code, &detail)),
            other => Err(MeshError::Codec(format!(
                "unexpected forward response: {other:?}"
            ))),
        }
    }

    /// Obtains a linearizable read index from the leader, local or remote.
    /// Callers wait for the local state machine to reach the index before
    /// reading.
    pub async fn read_index(&self) -> Result<u64, MeshError> {
        match self.raft.read_barrier().await {
            Ok(index) => Ok(index),
            Err(MeshError::NotLeader(Some(leader))) => {
                let response: RaftRpcResponse = self
                    .transport
                    .send(&leader, ProtocolId::Raft, &RaftRpc::ReadBarrier)
                    .await?;
                match response {
                    RaftRpcResponse::ReadIndex { result } => {
                        result.map_err(|(code, detail)| MeshError::from_code(code, &detail))
                    }
                    RaftRpcResponse::Error { code, detail } => {
                        Err(MeshError::from_code(code, &detail))
                    }
                    other => Err(MeshError::Codec(format!(
                        "unexpected read-index response: {other:?}"
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }
}
