// src/core/state/store.rs

//! The typed view over the replicated log. Each committed record is decoded
//! into the data model, indexed in memory, and fanned out to subscribers in
//! commit order. Writers are serialized through the consensus apply
//! callback; readers go through a read-write lock.

use crate::core::raft::{Entry, LogRecord, StateMachine};
use crate::core::state::events::{StateEvent, StateTopic};
use crate::core::state::keys::{self, KeyRef};
use crate::core::state::types::{
    ModelRecord, NodeLifecycle, NodeRecord, ReplicaRecord, ReplicaStatus, ReplicationPolicy,
};
use crate::core::transport::framing::{from_wire, to_wire};
use crate::core::{MeshError, ModelId, NodeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Default)]
struct Indexes {
    raw: BTreeMap<Vec<u8>, Vec<u8>>,
    nodes: HashMap<NodeId, NodeRecord>,
    models: HashMap<ModelId, ModelRecord>,
    replicas: HashMap<ModelId, BTreeMap<NodeId, ReplicaRecord>>,
    policies: HashMap<ModelId, ReplicationPolicy>,
    cfg: BTreeMap<String, Vec<u8>>,
}

struct Subscriber {
    topic: StateTopic,
    tx: mpsc::Sender<StateEvent>,
    /// Set when the queue overflowed; the subscriber gets one `Lagged`
    /// event and nothing else until it is delivered.
    lagged: bool,
}

/// Snapshot image format: the raw key/value map plus the applied index.
#[derive(bincode::Encode, bincode::Decode)]
struct SnapshotImage {
    applied: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

pub struct StateStore {
    inner: parking_lot::RwLock<Indexes>,
    subs: parking_lot::Mutex<Vec<Subscriber>>,
    applied_tx: watch::Sender<u64>,
    applied_rx: watch::Receiver<u64>,
    event_queue_capacity: usize,
}

impl StateStore {
    pub fn new(event_queue_capacity: usize) -> Self {
        let (applied_tx, applied_rx) = watch::channel(0);
        Self {
            inner: parking_lot::RwLock::new(Indexes::default()),
            subs: parking_lot::Mutex::new(Vec::new()),
            applied_tx,
            applied_rx,
            event_queue_capacity,
        }
    }

    // --- Subscriptions ---

    /// Subscribes to one topic. Events arrive in commit order on a bounded
    /// queue; if the queue overflows, pending events are dropped and a
    /// single `Lagged` event tells the subscriber to resync from current
    /// state.
    pub fn subscribe(&self, topic: StateTopic) -> mpsc::Receiver<StateEvent> {
        let (tx, rx) = mpsc::channel(self.event_queue_capacity);
        self.subs.lock().push(Subscriber {
            topic,
            tx,
            lagged: false,
        });
        rx
    }

    fn fanout(&self, event: StateEvent) {
        let Some(topic) = event.topic() else { return };
        let mut subs = self.subs.lock();
        subs.retain_mut(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if sub.topic != topic && !sub.lagged {
                return true;
            }
            if sub.lagged {
                // Only the resync marker goes out until it fits.
                if sub.topic == topic || matches!(event, StateEvent::Lagged) {
                    if sub.tx.try_send(StateEvent::Lagged).is_ok() {
                        sub.lagged = false;
                    }
                }
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("State subscriber lagged on topic {topic:?}; dropping events");
                    sub.lagged = true;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn mark_all_lagged(&self) {
        let mut subs = self.subs.lock();
        for sub in subs.iter_mut() {
            if sub.tx.try_send(StateEvent::Lagged).is_err() {
                sub.lagged = true;
            }
        }
    }

    // --- Applied-index tracking ---

    pub fn applied_index(&self) -> u64 {
        *self.applied_rx.borrow()
    }

    /// Waits until the local state machine has applied at least `index`.
    /// Used with a read-index barrier for linearizable reads.
    pub async fn wait_applied(&self, index: u64) -> Result<(), MeshError> {
        let mut rx = self.applied_rx.clone();
        loop {
            if *rx.borrow() >= index {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| MeshError::Internal("applied watch closed".to_string()))?;
        }
    }

    // --- Typed reads (stale by design; pair with wait_applied for
    // linearizable reads) ---

    pub fn node(&self, id: &NodeId) -> Option<NodeRecord> {
        self.inner.read().nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.inner.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn live_nodes(&self) -> Vec<NodeRecord> {
        self.nodes()
            .into_iter()
            .filter(|n| n.state == NodeLifecycle::Live)
            .collect()
    }

    pub fn model(&self, id: &ModelId) -> Option<ModelRecord> {
        self.inner.read().models.get(id).cloned()
    }

    pub fn models(&self) -> Vec<ModelRecord> {
        let mut models: Vec<ModelRecord> = self.inner.read().models.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn replica(&self, model: &ModelId, node: &NodeId) -> Option<ReplicaRecord> {
        self.inner
            .read()
            .replicas
            .get(model)
            .and_then(|per_node| per_node.get(node))
            .cloned()
    }

    pub fn replicas_of(&self, model: &ModelId) -> Vec<ReplicaRecord> {
        self.inner
            .read()
            .replicas
            .get(model)
            .map(|per_node| per_node.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn replicas_on(&self, node: &NodeId) -> Vec<ReplicaRecord> {
        self.inner
            .read()
            .replicas
            .values()
            .filter_map(|per_node| per_node.get(node))
            .cloned()
            .collect()
    }

    /// Nodes that are live and hold a ready replica of the model: the only
    /// legal scheduling candidates.
    pub fn serving_candidates(&self, model: &ModelId) -> Vec<NodeRecord> {
        let inner = self.inner.read();
        let Some(per_node) = inner.replicas.get(model) else {
            return Vec::new();
        };
        let mut candidates: Vec<NodeRecord> = per_node
            .iter()
            .filter(|(_, replica)| replica.status == ReplicaStatus::Ready)
            .filter_map(|(node_id, _)| inner.nodes.get(node_id))
            .filter(|node| node.state == NodeLifecycle::Live)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    pub fn policy(&self, model: &ModelId) -> Option<ReplicationPolicy> {
        self.inner.read().policies.get(model).cloned()
    }

    pub fn cfg_get(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.read().cfg.get(name).cloned()
    }

    /// Count of models a node currently holds in any non-deleted status;
    /// used by placement tie-breaking.
    pub fn model_count_on(&self, node: &NodeId) -> usize {
        self.inner
            .read()
            .replicas
            .values()
            .filter(|per_node| {
                per_node
                    .get(node)
                    .is_some_and(|r| r.status != ReplicaStatus::Deleted)
            })
            .count()
    }

    // --- Apply path (single writer: the consensus apply callback) ---

    fn apply_put(&self, key: &[u8], value: &[u8]) -> Option<StateEvent> {
        let mut inner = self.inner.write();
        inner.raw.insert(key.to_vec(), value.to_vec());
        match keys::parse_key(key)? {
            KeyRef::Node(id) => match from_wire::<NodeRecord>(value) {
                Ok(record) => {
                    inner.nodes.insert(id.to_string(), record.clone());
                    Some(StateEvent::NodeUpdated(record))
                }
                Err(e) => {
                    warn!("Undecodable node record at {id}: {e}");
                    None
                }
            },
            KeyRef::Model(id) => match from_wire::<ModelRecord>(value) {
                Ok(record) => {
                    inner.models.insert(id.to_string(), record.clone());
                    Some(StateEvent::ModelUpdated(record))
                }
                Err(e) => {
                    warn!("Undecodable model record at {id}: {e}");
                    None
                }
            },
            KeyRef::Replica { model, node } => match from_wire::<ReplicaRecord>(value) {
                Ok(record) => {
                    inner
                        .replicas
                        .entry(model.to_string())
                        .or_default()
                        .insert(node.to_string(), record.clone());
                    Some(StateEvent::ReplicaUpdated(record))
                }
                Err(e) => {
                    warn!("Undecodable replica record at {model}/{node}: {e}");
                    None
                }
            },
            KeyRef::Policy(id) => match from_wire::<ReplicationPolicy>(value) {
                Ok(record) => {
                    inner.policies.insert(id.to_string(), record.clone());
                    Some(StateEvent::PolicyUpdated(record))
                }
                Err(e) => {
                    warn!("Undecodable policy record at {id}: {e}");
                    None
                }
            },
            KeyRef::Cfg(name) => {
                inner.cfg.insert(name.to_string(), value.to_vec());
                Some(StateEvent::ConfigUpdated {
                    key: name.to_string(),
                    value: value.to_vec(),
                })
            }
        }
    }

    fn apply_delete(&self, key: &[u8]) -> Option<StateEvent> {
        let mut inner = self.inner.write();
        inner.raw.remove(key);
        match keys::parse_key(key)? {
            KeyRef::Node(id) => {
                inner.nodes.remove(id)?;
                Some(StateEvent::NodeRemoved(id.to_string()))
            }
            KeyRef::Model(id) => {
                inner.models.remove(id)?;
                Some(StateEvent::ModelRemoved(id.to_string()))
            }
            KeyRef::Replica { model, node } => {
                let per_node = inner.replicas.get_mut(model)?;
                per_node.remove(node)?;
                if per_node.is_empty() {
                    inner.replicas.remove(model);
                }
                Some(StateEvent::ReplicaRemoved {
                    model: model.to_string(),
                    node: node.to_string(),
                })
            }
            KeyRef::Policy(id) => {
                inner.policies.remove(id)?;
                Some(StateEvent::PolicyRemoved(id.to_string()))
            }
            KeyRef::Cfg(name) => {
                inner.cfg.remove(name)?;
                Some(StateEvent::ConfigRemoved(name.to_string()))
            }
        }
    }

    fn rebuild_typed(inner: &mut Indexes) {
        inner.nodes.clear();
        inner.models.clear();
        inner.replicas.clear();
        inner.policies.clear();
        inner.cfg.clear();
        let raw = std::mem::take(&mut inner.raw);
        for (key, value) in &raw {
            match keys::parse_key(key) {
                Some(KeyRef::Node(id)) => {
                    if let Ok(record) = from_wire::<NodeRecord>(value) {
                        inner.nodes.insert(id.to_string(), record);
                    }
                }
                Some(KeyRef::Model(id)) => {
                    if let Ok(record) = from_wire::<ModelRecord>(value) {
                        inner.models.insert(id.to_string(), record);
                    }
                }
                Some(KeyRef::Replica { model, node }) => {
                    if let Ok(record) = from_wire::<ReplicaRecord>(value) {
                        inner
                            .replicas
                            .entry(model.to_string())
                            .or_default()
                            .insert(node.to_string(), record);
                    }
                }
                Some(KeyRef::Policy(id)) => {
                    if let Ok(record) = from_wire::<ReplicationPolicy>(value) {
                        inner.policies.insert(id.to_string(), record);
                    }
                }
                Some(KeyRef::Cfg(name)) => {
                    inner.cfg.insert(name.to_string(), value.clone());
                }
                None => {}
            }
        }
        inner.raw = raw;
    }
}

impl StateMachine for StateStore {
    fn apply(&self, entry: &Entry) {
        let event = match &entry.record {
            LogRecord::Put { key, value } => self.apply_put(key, value),
            LogRecord::Delete { key } => self.apply_delete(key),
            _ => None,
        };
        let _ = self.applied_tx.send(entry.index);
        if let Some(event) = event {
            self.fanout(event);
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, MeshError> {
        let inner = self.inner.read();
        let image = SnapshotImage {
            applied: self.applied_index(),
            entries: inner
                .raw
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        to_wire(&image)
    }

    fn restore(&self, data: &[u8]) -> Result<(), MeshError> {
        let image: SnapshotImage = from_wire(data)?;
        {
            let mut inner = self.inner.write();
            inner.raw = image.entries.into_iter().collect();
            Self::rebuild_typed(&mut inner);
        }
        let _ = self.applied_tx.send(image.applied);
        // Incremental events cannot describe a wholesale replacement.
        self.mark_all_lagged();
        Ok(())
    }
}

/// Builds the server-side proposal validator enforcing the store's
/// invariants before commit.
pub fn proposal_validator(store: Arc<StateStore>, leader_id: NodeId) -> crate::core::raft::ProposalValidator {
    Arc::new(move |record: &LogRecord, proposer: &NodeId| {
        match record {
            LogRecord::Put { key, value } => match keys::parse_key(key) {
                Some(KeyRef::Node(id)) => {
                    let node: NodeRecord = from_wire(value).map_err(|e| {
                        MeshError::InvariantViolation(format!("node record: {e}"))
                    })?;
                    if node.id != id {
                        return Err(MeshError::InvariantViolation(
                            "node record id does not match its key".to_string(),
                        ));
                    }
                    if !keys::id_is_clean(id) {
                        return Err(MeshError::InvariantViolation(
                            "node id contains reserved separator".to_string(),
                        ));
                    }
                    // A node may only write its own record; lifecycle
                    // transitions come from the leader.
                    if *proposer != node.id && *proposer != leader_id {
                        return Err(MeshError::InvariantViolation(format!(
                            "{proposer} may not write node record for {}",
                            node.id
                        )));
                    }
                    Ok(())
                }
                Some(KeyRef::Model(id)) => {
                    let model: ModelRecord = from_wire(value).map_err(|e| {
                        MeshError::InvariantViolation(format!("model record: {e}"))
                    })?;
                    if model.id != id {
                        return Err(MeshError::InvariantViolation(
                            "model record id does not match its key".to_string(),
                        ));
                    }
                    if !keys::id_is_clean(id) {
                        return Err(MeshError::InvariantViolation(
                            "model id contains reserved separator".to_string(),
                        ));
                    }
                    // Model descriptors are immutable once published.
                    if let Some(existing) = store.model(&model.id) {
                        if existing != model {
                            return Err(MeshError::InvariantViolation(format!(
                                "model {} is already published with different content",
                                model.id
                            )));
                        }
                    }
                    Ok(())
                }
                Some(KeyRef::Replica { model, node }) => {
                    let replica: ReplicaRecord = from_wire(value).map_err(|e| {
                        MeshError::InvariantViolation(format!("replica record: {e}"))
                    })?;
                    if replica.model != model || replica.node != node {
                        return Err(MeshError::InvariantViolation(
                            "replica record ids do not match their key".to_string(),
                        ));
                    }
                    // A replica cannot exist without its node and model.
                    if store.node(&replica.node).is_none() {
                        return Err(MeshError::InvariantViolation(format!(
                            "replica references unknown node {}",
                            replica.node
                        )));
                    }
                    if store.model(&replica.model).is_none() {
                        return Err(MeshError::InvariantViolation(format!(
                            "replica references unknown model {}",
                            replica.model
                        )));
                    }
                    Ok(())
                }
                Some(KeyRef::Policy(id)) => {
                    let policy: ReplicationPolicy = from_wire(value).map_err(|e| {
                        MeshError::InvariantViolation(format!("policy record: {e}"))
                    })?;
                    if policy.model != id {
                        return Err(MeshError::InvariantViolation(
                            "policy record id does not match its key".to_string(),
                        ));
                    }
                    if policy.min < 1 {
                        return Err(MeshError::InvariantViolation(
                            "replication minimum must be at least 1".to_string(),
                        ));
                    }
                    if policy.max != 0 && policy.max < policy.min {
                        return Err(MeshError::InvariantViolation(
                            "replication maximum below minimum".to_string(),
                        ));
                    }
                    Ok(())
                }
                Some(KeyRef::Cfg(_)) => Ok(()),
                None => Err(MeshError::InvariantViolation(format!(
                    "key outside the known namespaces: {:?}",
                    String::from_utf8_lossy(key)
                ))),
            },
            LogRecord::Delete { key } => match keys::parse_key(key) {
                Some(KeyRef::Node(_)) => {
                    if *proposer != leader_id {
                        return Err(MeshError::InvariantViolation(
                            "only the leader removes node records".to_string(),
                        ));
                    }
                    Ok(())
                }
                Some(KeyRef::Model(id)) => {
                    let live_replicas = store
                        .replicas_of(&id.to_string())
                        .into_iter()
                        .filter(|r| r.status != ReplicaStatus::Deleted)
                        .count();
                    if live_replicas > 0 {
                        return Err(MeshError::InvariantViolation(format!(
                            "model {id} still has {live_replicas} replicas"
                        )));
                    }
                    Ok(())
                }
                Some(_) => Ok(()),
                None => Err(MeshError::InvariantViolation(
                    "delete outside the known namespaces".to_string(),
                )),
            },
            _ => Ok(()),
        }
    })
}
