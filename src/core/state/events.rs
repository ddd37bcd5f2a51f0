// src/core/state/events.rs

//! Change events fanned out to local subscribers after every committed
//! record, in commit order per subscriber.

use crate::core::state::types::{ModelRecord, NodeRecord, ReplicaRecord, ReplicationPolicy};
use crate::core::{ModelId, NodeId};

/// Subscription topics, one per entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTopic {
    Node,
    Model,
    Replica,
    Policy,
    Config,
}

#[derive(Debug, Clone)]
pub enum StateEvent {
    NodeUpdated(NodeRecord),
    NodeRemoved(NodeId),
    ModelUpdated(ModelRecord),
    ModelRemoved(ModelId),
    ReplicaUpdated(ReplicaRecord),
    ReplicaRemoved { model: ModelId, node: NodeId },
    PolicyUpdated(ReplicationPolicy),
    PolicyRemoved(ModelId),
    ConfigUpdated { key: String, value: Vec<u8> },
    ConfigRemoved(String),
    /// The subscriber's queue overflowed (or the store restored from a
    /// snapshot); events were dropped and the subscriber must resync from
    /// the store's current state.
    Lagged,
}

impl StateEvent {
    pub fn topic(&self) -> Option<StateTopic> {
        match self {
            StateEvent::NodeUpdated(_) | StateEvent::NodeRemoved(_) => Some(StateTopic::Node),
            StateEvent::ModelUpdated(_) | StateEvent::ModelRemoved(_) => Some(StateTopic::Model),
            StateEvent::ReplicaUpdated(_) | StateEvent::ReplicaRemoved { .. } => {
                Some(StateTopic::Replica)
            }
            StateEvent::PolicyUpdated(_) | StateEvent::PolicyRemoved(_) => Some(StateTopic::Policy),
            StateEvent::ConfigUpdated { .. } | StateEvent::ConfigRemoved(_) => {
                Some(StateTopic::Config)
            }
            StateEvent::Lagged => None,
        }
    }
}
