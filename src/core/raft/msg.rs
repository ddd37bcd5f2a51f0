// src/core/raft/msg.rs

//! Log records, RPC frames, and status types for the consensus subsystem.

use crate::core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The unit written to the replicated log. Keys are byte strings; values are
/// opaque bytes interpreted by the state store.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub enum LogRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// An on-demand request for every node to take a snapshot once applied.
    SnapshotMarker,
    MembershipChange(Membership),
    /// Appended by a fresh leader to commit entries from earlier terms.
    Noop,
}

/// Voting membership plus non-voting learners that still receive the log.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, Default, PartialEq, Eq,
)]
pub struct Membership {
    pub voters: BTreeSet<NodeId>,
    pub learners: BTreeSet<NodeId>,
}

impl Membership {
    pub fn contains(&self, node: &NodeId) -> bool {
        self.voters.contains(node) || self.learners.contains(node)
    }

    /// Replication targets: everyone but the local node.
    pub fn peers_of(&self, me: &NodeId) -> Vec<NodeId> {
        self.voters
            .iter()
            .chain(self.learners.iter())
            .filter(|id| *id != me)
            .cloned()
            .collect()
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub record: LogRecord,
}

/// Durable per-node vote state. Lost vote state can elect two leaders in
/// one term, so this is fsynced before any RPC that depends on it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// A single-server membership operation.
#[derive(Debug, Clone)]
pub enum MembershipOp {
    AddVoter(NodeId),
    RemoveVoter(NodeId),
    DemoteVoter(NodeId),
}

/// Protocol-native messages carried on the `raft` stream protocol.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum RaftRpc {
    RequestVote {
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    AppendEntries {
        term: u64,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    },
    InstallSnapshot {
        term: u64,
        leader: NodeId,
        last_index: u64,
        last_term: u64,
        membership: Membership,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    },
    /// A follower submitting a write on behalf of a client; the leader
    /// commits it and answers with the applied index.
    ForwardPropose {
        record: LogRecord,
        proposer: NodeId,
    },
    /// A follower requesting a linearizable read barrier from the leader.
    ReadBarrier,
}

#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum RaftRpcResponse {
    Vote {
        term: u64,
        granted: bool,
    },
    Append {
        term: u64,
        success: bool,
        /// First index the leader should retry from after a mismatch.
        conflict_index: u64,
    },
    Snapshot {
        term: u64,
    },
    Propose {
        result: Result<u64, (u16, String)>,
    },
    ReadIndex {
        result: Result<u64, (u16, String)>,
    },
    Error {
        code: u16,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        })
    }
}

/// Published through a watch channel after every state change.
#[derive(Debug, Clone, Default)]
pub struct RaftStatus {
    pub id: NodeId,
    pub term: u64,
    pub role: RaftRole,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub membership: Membership,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}
