// src/core/raft/node.rs

//! The consensus core: one task owning all Raft state, driven by an API
//! channel and timers. Replication RPCs run on spawned helpers that report
//! outcomes back into the same channel, so the core never blocks on the
//! network.

use crate::config::RaftConfig;
use crate::core::raft::msg::{
    Entry, HardState, LogRecord, Membership, MembershipOp, RaftRole, RaftRpc, RaftRpcResponse,
    RaftStatus,
};
use crate::core::raft::net::RaftNetwork;
use crate::core::raft::storage::{LogStore, SnapshotMeta};
use crate::core::raft::{ProposalValidator, StateMachine};
use crate::core::{MeshError, NodeId};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Messages handled by the consensus core.
pub enum RaftMsg {
    Propose {
        record: LogRecord,
        proposer: NodeId,
        tx: oneshot::Sender<Result<u64, MeshError>>,
    },
    ReadBarrier {
        tx: oneshot::Sender<Result<u64, MeshError>>,
    },
    ChangeMembership {
        op: MembershipOp,
        tx: oneshot::Sender<Result<u64, MeshError>>,
    },
    TriggerSnapshot {
        tx: oneshot::Sender<Result<u64, MeshError>>,
    },
    Rpc {
        from: NodeId,
        rpc: RaftRpc,
        tx: oneshot::Sender<RaftRpcResponse>,
    },
    // Internal: outcomes reported by spawned replication helpers.
    AppendOutcome {
        peer: NodeId,
        probe_id: u64,
        sent_up_to: u64,
        result: Result<(u64, bool, u64), MeshError>,
    },
    VoteOutcome {
        election_term: u64,
        from: NodeId,
        resp_term: u64,
        granted: bool,
    },
    SnapshotSent {
        peer: NodeId,
        last_index: u64,
        ok: bool,
    },
}

struct PeerProgress {
    next_index: u64,
    match_index: u64,
    inflight_since: Option<Instant>,
}

struct ReadWaiter {
    read_index: u64,
    min_probe: u64,
    acks: HashSet<NodeId>,
    tx: oneshot::Sender<Result<u64, MeshError>>,
}

pub struct RaftNode {
    id: NodeId,
    cfg: RaftConfig,
    store: LogStore,
    network: Arc<dyn RaftNetwork>,
    sm: Arc<dyn StateMachine>,
    validator: Option<ProposalValidator>,

    role: RaftRole,
    leader: Option<NodeId>,
    membership: Membership,
    commit_index: u64,
    last_applied: u64,
    next_deadline: Instant,

    // Leader state.
    progress: HashMap<NodeId, PeerProgress>,
    pending_proposals: BTreeMap<u64, (u64, oneshot::Sender<Result<u64, MeshError>>)>,
    pending_membership: Option<u64>,
    read_waiters: Vec<ReadWaiter>,
    probe_seq: u64,
    want_snapshot: bool,

    // Candidate state.
    votes_granted: HashSet<NodeId>,

    // Follower snapshot reception.
    snapshot_buffer: Option<(u64, Vec<u8>)>,

    rx_api: mpsc::Receiver<RaftMsg>,
    api_tx: mpsc::Sender<RaftMsg>,
    status_tx: watch::Sender<RaftStatus>,
}

impl RaftNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        cfg: RaftConfig,
        store: LogStore,
        network: Arc<dyn RaftNetwork>,
        sm: Arc<dyn StateMachine>,
        validator: Option<ProposalValidator>,
        rx_api: mpsc::Receiver<RaftMsg>,
        api_tx: mpsc::Sender<RaftMsg>,
        status_tx: watch::Sender<RaftStatus>,
        bootstrap: bool,
    ) -> Result<Self, MeshError> {
        // Recover membership: the newest change in the log wins, else the
        // snapshot's, else empty (awaiting bootstrap or a snapshot).
        let mut membership = store
            .snapshot_meta()
            .map(|m| m.membership.clone())
            .unwrap_or_default();
        for index in store.first_index()..=store.last_index() {
            if let Some(Entry {
                record: LogRecord::MembershipChange(m),
                ..
            }) = store.entry(index)
            {
                membership = m.clone();
            }
        }

        // Restore the state machine from the latest snapshot.
        let snapshot_applied = match store.snapshot_meta() {
            Some(meta) => {
                if let Some(data) = store.load_snapshot_data()? {
                    sm.restore(&data)?;
                }
                meta.last_index
            }
            None => 0,
        };

        let mut node = Self {
            id: id.clone(),
            cfg,
            store,
            network,
            sm,
            validator,
            role: RaftRole::Follower,
            leader: None,
            membership,
            commit_index: snapshot_applied,
            last_applied: snapshot_applied,
            next_deadline: Instant::now(),
            progress: HashMap::new(),
            pending_proposals: BTreeMap::new(),
            pending_membership: None,
            read_waiters: Vec::new(),
            probe_seq: 0,
            want_snapshot: false,
            votes_granted: HashSet::new(),
            snapshot_buffer: None,
            rx_api,
            api_tx,
            status_tx,
        };

        if bootstrap && node.store.last_index() == 0 && node.membership.voters.is_empty() {
            info!("Bootstrapping single-node cluster as {id}");
            node.membership.voters.insert(id);
        }
        node.reset_election_deadline();
        Ok(node)
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Raft node {} starting: term={}, last_index={}",
            self.id,
            self.store.hard_state().current_term,
            self.store.last_index()
        );
        self.publish_status();

        loop {
            let deadline = tokio::time::Instant::from_std(self.next_deadline);
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Raft node shutting down.");
                    return;
                }
                maybe = self.rx_api.recv() => {
                    let Some(msg) = maybe else { return };
                    self.handle_msg(msg);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle_timer();
                }
            }
            self.publish_status();
        }
    }

    // --- Timers and role transitions ---

    fn reset_election_deadline(&mut self) {
        let span = rand::thread_rng()
            .gen_range(self.cfg.election_timeout_min_ms..=self.cfg.election_timeout_max_ms);
        self.next_deadline = Instant::now() + Duration::from_millis(span);
    }

    fn handle_timer(&mut self) {
        match self.role {
            RaftRole::Leader => {
                self.broadcast_append();
                self.next_deadline =
                    Instant::now() + Duration::from_millis(self.cfg.heartbeat_interval_ms);
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if self.membership.voters.contains(&self.id) {
                    self.start_election();
                } else {
                    // Learners never campaign.
                    self.reset_election_deadline();
                }
            }
        }
    }

    fn start_election(&mut self) {
        let term = self.store.hard_state().current_term + 1;
        if let Err(e) = self.store.save_hard_state(HardState {
            current_term: term,
            voted_for: Some(self.id.clone()),
        }) {
            error!("Cannot persist vote; refusing to campaign: {e}");
            self.reset_election_deadline();
            return;
        }
        self.role = RaftRole::Candidate;
        self.leader = None;
        self.votes_granted = HashSet::from([self.id.clone()]);
        self.reset_election_deadline();
        debug!("Starting election for term {term}");

        if self.votes_granted.len() >= self.membership.quorum() {
            self.become_leader();
            return;
        }

        let last_log_index = self.store.last_index();
        let last_log_term = self.store.last_term();
        for peer in self.membership.voters.clone() {
            if peer == self.id {
                continue;
            }
            let network = self.network.clone();
            let api_tx = self.api_tx.clone();
            let candidate = self.id.clone();
            tokio::spawn(async move {
                let rpc = RaftRpc::RequestVote {
                    term,
                    candidate,
                    last_log_index,
                    last_log_term,
                };
                if let Ok(RaftRpcResponse::Vote {
                    term: resp_term,
                    granted,
                }) = network.send(&peer, rpc).await
                {
                    let _ = api_tx
                        .send(RaftMsg::VoteOutcome {
                            election_term: term,
                            from: peer,
                            resp_term,
                            granted,
                        })
                        .await;
                }
            });
        }
    }

    fn become_leader(&mut self) {
        info!(
            "Won election: leader for term {}",
            self.store.hard_state().current_term
        );
        self.role = RaftRole::Leader;
        self.leader = Some(self.id.clone());
        self.progress.clear();
        let next = self.store.last_index() + 1;
        for peer in self.membership.peers_of(&self.id) {
            self.progress.insert(
                peer,
                PeerProgress {
                    next_index: next,
                    match_index: 0,
                    inflight_since: None,
                },
            );
        }
        // A no-op from the new term makes earlier entries committable.
        let _ = self.leader_append(LogRecord::Noop, None);
        self.broadcast_append();
        self.next_deadline = Instant::now() + Duration::from_millis(self.cfg.heartbeat_interval_ms);
        crate::core::metrics::RAFT_IS_LEADER.set(1.0);
    }

    fn step_down(&mut self, term: u64, leader: Option<NodeId>) {
        let hs = self.store.hard_state().clone();
        if term > hs.current_term {
            if let Err(e) = self.store.save_hard_state(HardState {
                current_term: term,
                voted_for: None,
            }) {
                error!("Cannot persist term {term}: {e}");
            }
        }
        if self.role == RaftRole::Leader {
            crate::core::metrics::RAFT_IS_LEADER.set(0.0);
            // Pending work cannot complete under a new leader.
            for (_, (_, tx)) in std::mem::take(&mut self.pending_proposals) {
                let _ = tx.send(Err(MeshError::NotLeader(leader.clone())));
            }
            for waiter in std::mem::take(&mut self.read_waiters) {
                let _ = waiter.tx.send(Err(MeshError::NotLeader(leader.clone())));
            }
            self.pending_membership = None;
        }
        self.role = RaftRole::Follower;
        if leader.is_some() {
            self.leader = leader;
        }
        self.reset_election_deadline();
    }

    // --- Message handling ---

    fn handle_msg(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::Propose {
                record,
                proposer,
                tx,
            } => self.handle_propose(record, proposer, tx),
            RaftMsg::ReadBarrier { tx } => self.handle_read_barrier(tx),
            RaftMsg::ChangeMembership { op, tx } => self.handle_change_membership(op, tx),
            RaftMsg::TriggerSnapshot { tx } => {
                let result = self.take_snapshot().map(|_| self.last_applied);
                let _ = tx.send(result);
            }
            RaftMsg::Rpc { from, rpc, tx } => self.handle_rpc(from, rpc, tx),
            RaftMsg::AppendOutcome {
                peer,
                probe_id,
                sent_up_to,
                result,
            } => self.handle_append_outcome(peer, probe_id, sent_up_to, result),
            RaftMsg::VoteOutcome {
                election_term,
                from,
                resp_term,
                granted,
            } => self.handle_vote_outcome(election_term, from, resp_term, granted),
            RaftMsg::SnapshotSent {
                peer,
                last_index,
                ok,
            } => {
                if let Some(progress) = self.progress.get_mut(&peer) {
                    progress.inflight_since = None;
                    if ok {
                        progress.match_index = last_index;
                        progress.next_index = last_index + 1;
                    }
                }
            }
        }
    }

    fn handle_propose(
        &mut self,
        record: LogRecord,
        proposer: NodeId,
        tx: oneshot::Sender<Result<u64, MeshError>>,
    ) {
        if self.role != RaftRole::Leader {
            let _ = tx.send(Err(MeshError::NotLeader(self.leader.clone())));
            return;
        }
        if let Some(validator) = &self.validator {
            if let Err(e) = validator(&record, &proposer) {
                let _ = tx.send(Err(e));
                return;
            }
        }
        match self.leader_append(record, Some(tx)) {
            Ok(_) => self.broadcast_append(),
            Err(_) => {}
        }
    }

    /// Appends an entry to the leader's log. The proposal future resolves
    /// when the entry commits, or fails if leadership is lost first.
    fn leader_append(
        &mut self,
        record: LogRecord,
        tx: Option<oneshot::Sender<Result<u64, MeshError>>>,
    ) -> Result<u64, MeshError> {
        let term = self.store.hard_state().current_term;
        let index = self.store.last_index() + 1;
        let entry = Entry {
            term,
            index,
            record: record.clone(),
        };
        if let Err(e) = self.store.append(std::slice::from_ref(&entry)) {
            error!("Log append failed: {e}");
            if let Some(tx) = tx {
                let _ = tx.send(Err(e.clone()));
            }
            return Err(e);
        }
        if let LogRecord::MembershipChange(m) = &record {
            self.adopt_membership(m.clone());
            self.pending_membership = Some(index);
        }
        if let Some(tx) = tx {
            self.pending_proposals.insert(index, (term, tx));
        }
        self.advance_commit();
        Ok(index)
    }

    fn handle_read_barrier(&mut self, tx: oneshot::Sender<Result<u64, MeshError>>) {
        if self.role != RaftRole::Leader {
            let _ = tx.send(Err(MeshError::NotLeader(self.leader.clone())));
            return;
        }
        let read_index = self.commit_index;
        if self.membership.quorum() == 1 && self.last_applied >= read_index {
            let _ = tx.send(Ok(read_index));
            return;
        }
        self.probe_seq += 1;
        self.read_waiters.push(ReadWaiter {
            read_index,
            min_probe: self.probe_seq,
            acks: HashSet::from([self.id.clone()]),
            tx,
        });
        self.broadcast_append();
    }

    fn handle_change_membership(
        &mut self,
        op: MembershipOp,
        tx: oneshot::Sender<Result<u64, MeshError>>,
    ) {
        if self.role != RaftRole::Leader {
            let _ = tx.send(Err(MeshError::NotLeader(self.leader.clone())));
            return;
        }
        if self.pending_membership.is_some() {
            let _ = tx.send(Err(MeshError::InvalidRequest(
                "a membership change is already in flight".to_string(),
            )));
            return;
        }
        let mut next = self.membership.clone();
        match &op {
            MembershipOp::AddVoter(node) => {
                if next.voters.contains(node) {
                    let _ = tx.send(Ok(self.commit_index));
                    return;
                }
                next.learners.remove(node);
                next.voters.insert(node.clone());
            }
            MembershipOp::RemoveVoter(node) => {
                if !next.contains(node) {
                    let _ = tx.send(Ok(self.commit_index));
                    return;
                }
                next.voters.remove(node);
                next.learners.remove(node);
            }
            MembershipOp::DemoteVoter(node) => {
                if !next.voters.contains(node) {
                    let _ = tx.send(Ok(self.commit_index));
                    return;
                }
                next.voters.remove(node);
                next.learners.insert(node.clone());
            }
        }
        if next.voters.is_empty() {
            let _ = tx.send(Err(MeshError::InvariantViolation(
                "cannot remove the last voter".to_string(),
            )));
            return;
        }
        if self
            .leader_append(LogRecord::MembershipChange(next), Some(tx))
            .is_ok()
        {
            self.broadcast_append();
        }
    }

    fn adopt_membership(&mut self, m: Membership) {
        // Configurations take effect as soon as they are appended.
        let next_index = self.store.last_index() + 1;
        for peer in m.peers_of(&self.id) {
            self.progress.entry(peer).or_insert(PeerProgress {
                next_index,
                match_index: 0,
                inflight_since: None,
            });
        }
        self.progress.retain(|peer, _| m.contains(peer));
        self.membership = m;
    }

    // --- RPC handling ---

    fn handle_rpc(&mut self, from: NodeId, rpc: RaftRpc, tx: oneshot::Sender<RaftRpcResponse>) {
        match rpc {
            RaftRpc::RequestVote {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => {
                let resp = self.handle_request_vote(term, candidate, last_log_index, last_log_term);
                let _ = tx.send(resp);
            }
            RaftRpc::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let resp = self.handle_append_entries(
                    term,
                    leader,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                let _ = tx.send(resp);
            }
            RaftRpc::InstallSnapshot {
                term,
                leader,
                last_index,
                last_term,
                membership,
                offset,
                data,
                done,
            } => {
                let resp = self.handle_install_snapshot(
                    term, leader, last_index, last_term, membership, offset, data, done,
                );
                let _ = tx.send(resp);
            }
            RaftRpc::ForwardPropose { record, proposer } => {
                if proposer != from {
                    let _ = tx.send(RaftRpcResponse::Error {
                        code: MeshError::AuthFailed(String::new()).code(),
                        detail: "proposer does not match session identity".to_string(),
                    });
                    return;
                }
                let (ptx, prx) = oneshot::channel();
                self.handle_propose(record, proposer, ptx);
                tokio::spawn(async move {
                    let result = match prx.await {
                        Ok(Ok(index)) => Ok(index),
                        Ok(Err(e)) => Err((e.code(), e.to_string())),
                        Err(_) => Err((MeshError::Aborted.code(), "proposal dropped".to_string())),
                    };
                    let _ = tx.send(RaftRpcResponse::Propose { result });
                });
            }
            RaftRpc::ReadBarrier => {
                let (btx, brx) = oneshot::channel();
                self.handle_read_barrier(btx);
                tokio::spawn(async move {
                    let result = match brx.await {
                        Ok(Ok(index)) => Ok(index),
                        Ok(Err(e)) => Err((e.code(), e.to_string())),
                        Err(_) => Err((MeshError::Aborted.code(), "barrier dropped".to_string())),
                    };
                    let _ = tx.send(RaftRpcResponse::ReadIndex { result });
                });
            }
        }
    }

    fn handle_request_vote(
        &mut self,
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftRpcResponse {
        let current = self.store.hard_state().current_term;
        if term < current {
            return RaftRpcResponse::Vote {
                term: current,
                granted: false,
            };
        }
        if term > current {
            self.step_down(term, None);
        }
        let hs = self.store.hard_state().clone();
        let up_to_date = (last_log_term, last_log_index)
            >= (self.store.last_term(), self.store.last_index());
        let can_vote = hs.voted_for.is_none() || hs.voted_for.as_ref() == Some(&candidate);

        if up_to_date && can_vote {
            if let Err(e) = self.store.save_hard_state(HardState {
                current_term: term,
                voted_for: Some(candidate.clone()),
            }) {
                error!("Cannot persist vote for {candidate}: {e}");
                return RaftRpcResponse::Vote {
                    term,
                    granted: false,
                };
            }
            self.reset_election_deadline();
            debug!("Granted vote to {candidate} for term {term}");
            RaftRpcResponse::Vote {
                term,
                granted: true,
            }
        } else {
            RaftRpcResponse::Vote {
                term,
                granted: false,
            }
        }
    }

    fn handle_append_entries(
        &mut self,
        term: u64,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    ) -> RaftRpcResponse {
        let current = self.store.hard_state().current_term;
        if term < current {
            return RaftRpcResponse::Append {
                term: current,
                success: false,
                conflict_index: 0,
            };
        }
        if term > current || self.role != RaftRole::Follower {
            self.step_down(term, Some(leader.clone()));
        }
        self.leader = Some(leader);
        self.reset_election_deadline();
        let term = self.store.hard_state().current_term;

        // Consistency check on the entry preceding the batch.
        if prev_log_index > self.store.last_index() {
            return RaftRpcResponse::Append {
                term,
                success: false,
                conflict_index: self.store.last_index() + 1,
            };
        }
        if prev_log_index >= self.store.first_index().saturating_sub(1) {
            match self.store.term_at(prev_log_index) {
                Some(t) if t == prev_log_term => {}
                Some(_) => {
                    return RaftRpcResponse::Append {
                        term,
                        success: false,
                        conflict_index: prev_log_index.max(1),
                    };
                }
                None => {
                    return RaftRpcResponse::Append {
                        term,
                        success: false,
                        conflict_index: self.store.first_index(),
                    };
                }
            }
        }

        // Append new entries, truncating on the first conflict. Entries
        // already covered by the local snapshot are skipped.
        let mut to_append: Vec<Entry> = Vec::new();
        for entry in entries {
            if entry.index < self.store.first_index() {
                continue;
            }
            if entry.index <= self.store.last_index() {
                match self.store.term_at(entry.index) {
                    Some(t) if t == entry.term => continue,
                    _ => {
                        if let Err(e) = self.store.truncate_from(entry.index) {
                            error!("Log truncate failed: {e}");
                            return RaftRpcResponse::Error {
                                code: e.code(),
                                detail: e.to_string(),
                            };
                        }
                        to_append.push(entry);
                    }
                }
            } else {
                to_append.push(entry);
            }
        }
        if !to_append.is_empty() {
            if let Err(e) = self.store.append(&to_append) {
                error!("Log append failed: {e}");
                return RaftRpcResponse::Error {
                    code: e.code(),
                    detail: e.to_string(),
                };
            }
            for entry in &to_append {
                if let LogRecord::MembershipChange(m) = &entry.record {
                    self.membership = m.clone();
                }
            }
        }

        let new_commit = leader_commit.min(self.store.last_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed();
        }

        RaftRpcResponse::Append {
            term,
            success: true,
            conflict_index: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader: NodeId,
        last_index: u64,
        last_term: u64,
        membership: Membership,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> RaftRpcResponse {
        let current = self.store.hard_state().current_term;
        if term < current {
            return RaftRpcResponse::Snapshot { term: current };
        }
        if term > current || self.role != RaftRole::Follower {
            self.step_down(term, Some(leader.clone()));
        }
        self.leader = Some(leader);
        self.reset_election_deadline();
        let term = self.store.hard_state().current_term;

        match &mut self.snapshot_buffer {
            Some((expected, buf)) if *expected == offset => {
                buf.extend_from_slice(&data);
                *expected += data.len() as u64;
            }
            _ if offset == 0 => {
                self.snapshot_buffer = Some((data.len() as u64, data));
            }
            _ => {
                // Out-of-order chunk: restart the transfer.
                self.snapshot_buffer = None;
                return RaftRpcResponse::Snapshot { term };
            }
        }

        if done {
            let Some((_, image)) = self.snapshot_buffer.take() else {
                return RaftRpcResponse::Snapshot { term };
            };
            let meta = SnapshotMeta {
                last_index,
                last_term,
                membership: membership.clone(),
            };
            if let Err(e) = self.store.save_snapshot(meta, &image) {
                error!("Failed to persist received snapshot: {e}");
                return RaftRpcResponse::Error {
                    code: e.code(),
                    detail: e.to_string(),
                };
            }
            if let Err(e) = self.sm.restore(&image) {
                error!("State machine refused snapshot: {e}");
                return RaftRpcResponse::Error {
                    code: e.code(),
                    detail: e.to_string(),
                };
            }
            self.membership = membership;
            self.commit_index = self.commit_index.max(last_index);
            self.last_applied = last_index;
            info!("Installed snapshot through index {last_index}");
        }
        RaftRpcResponse::Snapshot { term }
    }

    // --- Replication (leader) ---

    fn broadcast_append(&mut self) {
        if self.role != RaftRole::Leader {
            return;
        }
        self.probe_seq += 1;
        let probe_id = self.probe_seq;
        let term = self.store.hard_state().current_term;
        let leader = self.id.clone();
        let commit = self.commit_index;
        let stale_after = Duration::from_millis(self.cfg.election_timeout_max_ms * 2);

        let peers: Vec<NodeId> = self.progress.keys().cloned().collect();
        for peer in peers {
            let Some(progress) = self.progress.get_mut(&peer) else {
                continue;
            };
            if let Some(since) = progress.inflight_since {
                if since.elapsed() < stale_after {
                    continue;
                }
            }

            // A peer that fell behind the snapshotted prefix needs the full
            // image instead of log entries.
            if progress.next_index < self.store.first_index() {
                progress.inflight_since = Some(Instant::now());
                self.spawn_snapshot_send(peer);
                continue;
            }

            let prev_log_index = progress.next_index - 1;
            let Some(prev_log_term) = self.store.term_at(prev_log_index) else {
                progress.inflight_since = Some(Instant::now());
                self.spawn_snapshot_send(peer);
                continue;
            };
            let entries = self
                .store
                .entries_from(progress.next_index, self.cfg.max_append_entries);
            let sent_up_to = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
            progress.inflight_since = Some(Instant::now());

            let network = self.network.clone();
            let api_tx = self.api_tx.clone();
            let leader = leader.clone();
            tokio::spawn(async move {
                let rpc = RaftRpc::AppendEntries {
                    term,
                    leader,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: commit,
                };
                let result = match network.send(&peer, rpc).await {
                    Ok(RaftRpcResponse::Append {
                        term,
                        success,
                        conflict_index,
                    }) => Ok((term, success, conflict_index)),
                    Ok(other) => Err(MeshError::Codec(format!(
                        "unexpected append response: {other:?}"
                    ))),
                    Err(e) => Err(e),
                };
                let _ = api_tx
                    .send(RaftMsg::AppendOutcome {
                        peer,
                        probe_id,
                        sent_up_to,
                        result,
                    })
                    .await;
            });
        }
    }

    fn spawn_snapshot_send(&self, peer: NodeId) {
        let Ok(Some(data)) = self.store.load_snapshot_data() else {
            warn!("Peer {peer} needs a snapshot but none exists on disk");
            return;
        };
        let Some(meta) = self.store.snapshot_meta().cloned() else {
            return;
        };
        let term = self.store.hard_state().current_term;
        let leader = self.id.clone();
        let chunk = self.cfg.snapshot_chunk_bytes.max(1);
        let network = self.network.clone();
        let api_tx = self.api_tx.clone();
        tokio::spawn(async move {
            let total = data.len();
            let mut offset = 0usize;
            let mut ok = true;
            loop {
                let end = (offset + chunk).min(total);
                let done = end == total;
                let rpc = RaftRpc::InstallSnapshot {
                    term,
                    leader: leader.clone(),
                    last_index: meta.last_index,
                    last_term: meta.last_term,
                    membership: meta.membership.clone(),
                    offset: offset as u64,
                    data: data[offset..end].to_vec(),
                    done,
                };
                match network.send(&peer, rpc).await {
                    Ok(RaftRpcResponse::Snapshot { .. }) => {}
                    _ => {
                        ok = false;
                        break;
                    }
                }
                if done {
                    break;
                }
                offset = end;
            }
            let _ = api_tx
                .send(RaftMsg::SnapshotSent {
                    peer,
                    last_index: meta.last_index,
                    ok,
                })
                .await;
        });
    }

    fn handle_append_outcome(
        &mut self,
        peer: NodeId,
        probe_id: u64,
        sent_up_to: u64,
        result: Result<(u64, bool, u64), MeshError>,
    ) {
        if self.role != RaftRole::Leader || !self.progress.contains_key(&peer) {
            return;
        }
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.inflight_since = None;
        }

        match result {
            Ok((resp_term, success, conflict_index)) => {
                let current = self.store.hard_state().current_term;
                if resp_term > current {
                    self.step_down(resp_term, None);
                    return;
                }
                if success {
                    let behind = {
                        let last_index = self.store.last_index();
                        let Some(progress) = self.progress.get_mut(&peer) else {
                            return;
                        };
                        progress.match_index = progress.match_index.max(sent_up_to);
                        progress.next_index = progress.match_index + 1;
                        progress.next_index <= last_index
                    };
                    self.record_read_ack(&peer, probe_id);
                    self.advance_commit();
                    // Keep pushing if the peer is still behind.
                    if behind {
                        self.broadcast_append();
                    }
                } else {
                    if let Some(progress) = self.progress.get_mut(&peer) {
                        progress.next_index = conflict_index.max(1);
                    }
                    self.broadcast_append();
                }
            }
            Err(e) => {
                debug!("Append to {peer} failed: {e}");
            }
        }
    }

    fn handle_vote_outcome(
        &mut self,
        election_term: u64,
        from: NodeId,
        resp_term: u64,
        granted: bool,
    ) {
        let current = self.store.hard_state().current_term;
        if resp_term > current {
            self.step_down(resp_term, None);
            return;
        }
        if self.role != RaftRole::Candidate || election_term != current {
            return;
        }
        if granted {
            self.votes_granted.insert(from);
            if self.votes_granted.len() >= self.membership.quorum() {
                self.become_leader();
            }
        }
    }

    fn record_read_ack(&mut self, peer: &NodeId, probe_id: u64) {
        for waiter in &mut self.read_waiters {
            if probe_id >= waiter.min_probe {
                waiter.acks.insert(peer.clone());
            }
        }
        self.resolve_read_waiters();
    }

    fn resolve_read_waiters(&mut self) {
        let quorum = self.membership.quorum();
        let applied = self.last_applied;
        let mut remaining = Vec::new();
        for waiter in std::mem::take(&mut self.read_waiters) {
            if waiter.acks.len() >= quorum && applied >= waiter.read_index {
                let _ = waiter.tx.send(Ok(waiter.read_index));
            } else {
                remaining.push(waiter);
            }
        }
        self.read_waiters = remaining;
    }

    // --- Commit and apply ---

    fn advance_commit(&mut self) {
        if self.role != RaftRole::Leader {
            return;
        }
        let mut matches: Vec<u64> = self
            .membership
            .voters
            .iter()
            .map(|voter| {
                if *voter == self.id {
                    self.store.last_index()
                } else {
                    self.progress.get(voter).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.membership.quorum();
        let Some(&candidate) = matches.get(quorum - 1) else {
            return;
        };
        // Only entries from the current term commit by counting.
        let current = self.store.hard_state().current_term;
        if candidate > self.commit_index && self.store.term_at(candidate) == Some(current) {
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.store.entry(index).cloned() else {
                error!("Committed entry {index} missing from the log");
                break;
            };
            match &entry.record {
                LogRecord::Put { .. } | LogRecord::Delete { .. } => self.sm.apply(&entry),
                LogRecord::SnapshotMarker => self.want_snapshot = true,
                LogRecord::MembershipChange(m) => {
                    if self.pending_membership == Some(index) {
                        self.pending_membership = None;
                    }
                    // A leader voted out of the configuration steps down
                    // once the change commits.
                    if self.role == RaftRole::Leader && !m.voters.contains(&self.id) {
                        let term = self.store.hard_state().current_term;
                        info!("Removed from voting membership; stepping down");
                        // Resolve this proposal before dropping leader state.
                        if let Some((term_at, tx)) = self.pending_proposals.remove(&index) {
                            if term_at == entry.term {
                                let _ = tx.send(Ok(index));
                            } else {
                                let _ = tx.send(Err(MeshError::Aborted));
                            }
                        }
                        self.last_applied = index;
                        self.step_down(term, None);
                        continue;
                    }
                }
                LogRecord::Noop => {}
            }
            if let Some((term, tx)) = self.pending_proposals.remove(&index) {
                if term == entry.term {
                    let _ = tx.send(Ok(index));
                    crate::core::metrics::RAFT_PROPOSALS_TOTAL
                        .with_label_values(&["committed"])
                        .inc();
                } else {
                    let _ = tx.send(Err(MeshError::Aborted));
                    crate::core::metrics::RAFT_PROPOSALS_TOTAL
                        .with_label_values(&["aborted"])
                        .inc();
                }
            }
            self.last_applied = index;
        }

        // Proposals superseded by a conflicting suffix can never commit.
        let last = self.store.last_index();
        let stale: Vec<u64> = self
            .pending_proposals
            .range(..=self.last_applied)
            .map(|(i, _)| *i)
            .chain(
                self.pending_proposals
                    .range((last + 1)..)
                    .map(|(i, _)| *i),
            )
            .collect();
        for index in stale {
            if let Some((_, tx)) = self.pending_proposals.remove(&index) {
                let _ = tx.send(Err(MeshError::Aborted));
            }
        }

        self.resolve_read_waiters();
        self.maybe_snapshot();
        crate::core::metrics::RAFT_COMMIT_INDEX.set(self.commit_index as i64);
    }

    fn maybe_snapshot(&mut self) {
        let threshold_hit = self.store.appended_since_snapshot() >= self.cfg.snapshot_threshold;
        if !(threshold_hit || self.want_snapshot) {
            return;
        }
        self.want_snapshot = false;
        if let Err(e) = self.take_snapshot() {
            warn!("Snapshot failed: {e}");
        }
    }

    fn take_snapshot(&mut self) -> Result<(), MeshError> {
        if self.last_applied == 0 {
            return Ok(());
        }
        let data = self.sm.snapshot()?;
        let meta = SnapshotMeta {
            last_index: self.last_applied,
            last_term: self.store.term_at(self.last_applied).unwrap_or(0),
            membership: self.membership.clone(),
        };
        self.store.save_snapshot(meta, &data)?;
        info!("Snapshot taken through index {}", self.last_applied);
        Ok(())
    }

    fn publish_status(&self) {
        let status = RaftStatus {
            id: self.id.clone(),
            term: self.store.hard_state().current_term,
            role: self.role,
            leader: self.leader.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.store.last_index(),
            membership: self.membership.clone(),
        };
        crate::core::metrics::RAFT_TERM.set(status.term as i64);
        let _ = self.status_tx.send(status);
    }
}
