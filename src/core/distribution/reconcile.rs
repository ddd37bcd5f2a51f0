// src/core/distribution/reconcile.rs

//! The leader's reconcile loop: compares each model's desired replication
//! against the set of ready replicas and publishes placement changes into
//! the log. Runs on a bounded interval and on state-change events; silently
//! does nothing on followers.

use crate::config::DistributionConfig;
use crate::core::distribution::manager::DistributionManager;
use crate::core::distribution::placement;
use crate::core::raft::{LogRecord, Raft};
use crate::core::state::keys;
use crate::core::state::types::{
    NodeLifecycle, ReplicaRecord, ReplicaStatus, ReplicationPolicy,
};
use crate::core::state::{StateStore, StateTopic};
use crate::core::transport::framing::to_wire;
use crate::core::{MeshError, ModelId, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct ReconcileTask {
    cfg: DistributionConfig,
    store: Arc<StateStore>,
    manager: Arc<DistributionManager>,
    raft: Raft,
}

impl ReconcileTask {
    pub fn new(
        cfg: DistributionConfig,
        store: Arc<StateStore>,
        manager: Arc<DistributionManager>,
        raft: Raft,
    ) -> Self {
        Self {
            cfg,
            store,
            manager,
            raft,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.cfg.reconcile_interval_ms));
        let mut replica_rx = self.store.subscribe(StateTopic::Replica);
        let mut node_rx = self.store.subscribe(StateTopic::Node);
        let mut policy_rx = self.store.subscribe(StateTopic::Policy);
        info!("Reconcile loop started.");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Reconcile loop shutting down.");
                    return;
                }
                _ = tick.tick() => self.reconcile_all().await,
                Some(_) = replica_rx.recv() => self.reconcile_all().await,
                Some(_) = node_rx.recv() => self.reconcile_all().await,
                Some(_) = policy_rx.recv() => self.reconcile_all().await,
            }
        }
    }

    async fn reconcile_all(&self) {
        if !self.raft.is_leader() {
            return;
        }
        for model in self.store.models() {
            if let Err(e) = self.reconcile_model(&model.id).await {
                warn!("Reconcile of {} failed: {e}", model.id);
            }
        }
    }

    fn default_policy(&self, model: &ModelId) -> ReplicationPolicy {
        ReplicationPolicy {
            model: model.clone(),
            min: self.cfg.replication_min,
            max: self.cfg.replication_max,
            strategy: self.cfg.default_strategy.into(),
        }
    }

    async fn reconcile_model(&self, model_id: &ModelId) -> Result<(), MeshError> {
        let Some(model) = self.store.model(model_id) else {
            return Ok(());
        };
        let policy = self
            .store
            .policy(model_id)
            .unwrap_or_else(|| self.default_policy(model_id));
        let nodes = self.store.nodes();
        let replicas = self.store.replicas_of(model_id);

        // Replicas on nodes that are gone serve nobody; drop their records
        // so the deficit math sees reality.
        for replica in &replicas {
            let node_down = self
                .store
                .node(&replica.node)
                .map(|n| n.state == NodeLifecycle::Down)
                .unwrap_or(true);
            if node_down && replica.status != ReplicaStatus::Deleted {
                debug!(
                    "Dropping replica of {model_id} on unavailable node {}",
                    replica.node
                );
                self.raft
                    .propose(LogRecord::Delete {
                        key: keys::replica_key(model_id, &replica.node),
                    })
                    .await?;
            }
        }

        let replicas: Vec<ReplicaRecord> = self
            .store
            .replicas_of(model_id)
            .into_iter()
            .filter(|r| {
                self.store
                    .node(&r.node)
                    .is_some_and(|n| n.state != NodeLifecycle::Down)
            })
            .collect();

        let ready = replicas
            .iter()
            .filter(|r| r.status == ReplicaStatus::Ready)
            .count();
        let in_progress = replicas
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    ReplicaStatus::Pending | ReplicaStatus::Transferring
                )
            })
            .count();

        let live_count = nodes
            .iter()
            .filter(|n| n.state == NodeLifecycle::Live)
            .count();
        let min = policy.min as usize;
        let max = policy.effective_max(live_count.max(1)) as usize;

        let model_counts: HashMap<NodeId, usize> = nodes
            .iter()
            .map(|n| (n.id.clone(), self.store.model_count_on(&n.id)))
            .collect();

        // Under-replicated: plan new placements. Best-effort when the
        // cluster is smaller than the minimum.
        if ready + in_progress < min {
            let deficit = min - ready - in_progress;
            let chosen = placement::plan_additions(
                &model,
                policy.strategy,
                &nodes,
                &replicas,
                &model_counts,
                deficit,
                min,
            );
            if chosen.is_empty() && deficit > 0 {
                debug!(
                    "Model {model_id} needs {deficit} more replicas but no node qualifies"
                );
            }
            for node in chosen {
                info!("Placing replica of {model_id} on {node}");
                let source = placement::select_source(&replicas, &nodes, &None, &node);
                let replica = ReplicaRecord {
                    model: model_id.clone(),
                    node: node.clone(),
                    status: ReplicaStatus::Pending,
                    bytes_transferred: 0,
                    last_verified_ms: 0,
                    error: None,
                    source_hint: source,
                };
                self.raft
                    .propose(LogRecord::Put {
                        key: keys::replica_key(model_id, &node),
                        value: to_wire(&replica)?,
                    })
                    .await?;
                self.manager.notify_replanned(model_id);
            }
        }

        // Over-replicated: never exceed max, even under load.
        if ready > max {
            let excess = ready - max;
            for node in placement::plan_removals(&replicas, &model_counts, excess) {
                info!("Removing excess replica of {model_id} from {node}");
                let Some(mut replica) = replicas.iter().find(|r| r.node == node).cloned() else {
                    continue;
                };
                replica.status = ReplicaStatus::Deleted;
                self.raft
                    .propose(LogRecord::Put {
                        key: keys::replica_key(model_id, &node),
                        value: to_wire(&replica)?,
                    })
                    .await?;
            }
        }

        // Errored replicas below min get another plan once their node is
        // still usable; the manager's backoff caps the retry rate.
        if ready < min {
            for replica in &replicas {
                if replica.status == ReplicaStatus::Error {
                    let usable = self
                        .store
                        .node(&replica.node)
                        .is_some_and(|n| n.state == NodeLifecycle::Live);
                    if usable {
                        let mut retry = replica.clone();
                        retry.status = ReplicaStatus::Pending;
                        retry.error = None;
                        retry.source_hint =
                            placement::select_source(&replicas, &nodes, &None, &replica.node);
                        self.raft
                            .propose(LogRecord::Put {
                                key: keys::replica_key(model_id, &replica.node),
                                value: to_wire(&retry)?,
                            })
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }
}
