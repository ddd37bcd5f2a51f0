// src/core/distribution/manager.rs

//! The model distribution manager: tracks desired vs actual replication for
//! this node, drives chunk transfers, imports artifacts published through
//! the local engine, and verifies integrity.

use crate::config::DistributionConfig;
use crate::core::distribution::cas::ChunkStore;
use crate::core::distribution::manifest::{self, ManifestStore, sanitize_model_id};
use crate::core::distribution::placement;
use crate::core::distribution::transfer::{self, TransferProgress};
use crate::core::engine::EngineClient;
use crate::core::raft::{LogRecord, Proposer};
use crate::core::state::keys;
use crate::core::state::types::{
    ChunkInfo, FileEntry, ModelRecord, NodeLifecycle, ReplicaRecord, ReplicaStatus,
    ReplicationPolicy,
};
use crate::core::state::{StateEvent, StateStore, StateTopic};
use crate::core::transport::framing::to_wire;
use crate::core::transport::{ProtocolId, Transport};
use crate::core::{MeshError, ModelId, NodeId, now_ms};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Semaphore, broadcast, watch};
use tracing::{debug, info, warn};

struct RetryState {
    attempts: u32,
    not_before: Instant,
}

pub struct DistributionManager {
    cfg: DistributionConfig,
    node_id: NodeId,
    zone: Option<String>,
    store: Arc<StateStore>,
    transport: Arc<Transport>,
    proposer: Proposer,
    pub cas: Arc<ChunkStore>,
    manifests: ManifestStore,
    engine: Arc<EngineClient>,
    artifacts_root: PathBuf,
    inbound: Arc<Semaphore>,
    inflight: DashMap<ModelId, ()>,
    retries: DashMap<ModelId, RetryState>,
    cancels: DashMap<ModelId, watch::Sender<bool>>,
    pub active_transfers: DashMap<ModelId, Arc<TransferProgress>>,
}

impl DistributionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: DistributionConfig,
        node_id: NodeId,
        zone: Option<String>,
        store: Arc<StateStore>,
        transport: Arc<Transport>,
        proposer: Proposer,
        cas: Arc<ChunkStore>,
        manifests: ManifestStore,
        engine: Arc<EngineClient>,
        artifacts_root: PathBuf,
    ) -> Arc<Self> {
        let inbound = Arc::new(Semaphore::new(cfg.max_inbound_transfers.max(1)));
        Arc::new(Self {
            cfg,
            node_id,
            zone,
            store,
            transport,
            proposer,
            cas,
            manifests,
            engine,
            artifacts_root,
            inbound,
            inflight: DashMap::new(),
            retries: DashMap::new(),
            cancels: DashMap::new(),
            active_transfers: DashMap::new(),
        })
    }

    pub fn artifact_dir(&self, model: &ModelId) -> PathBuf {
        self.artifacts_root.join(sanitize_model_id(model))
    }

    /// Deletes chunks no manifest references. Run at startup before the
    /// node starts accepting transfers.
    pub async fn gc_unreferenced_chunks(&self) -> Result<usize, MeshError> {
        let mut referenced = HashSet::new();
        for record in self.manifests.list().await? {
            for chunk in &record.chunks {
                referenced.insert(chunk.digest.clone());
            }
        }
        self.cas.gc(&referenced).await
    }

    // --- Proposal helpers ---

    async fn propose_replica(&self, replica: &ReplicaRecord) -> Result<(), MeshError> {
        self.proposer
            .propose(LogRecord::Put {
                key: keys::replica_key(&replica.model, &replica.node),
                value: to_wire(replica)?,
            })
            .await?;
        Ok(())
    }

    async fn set_replica_status(
        &self,
        model: &ModelId,
        status: ReplicaStatus,
        bytes_transferred: u64,
        error: Option<String>,
    ) -> Result<(), MeshError> {
        let mut replica = self
            .store
            .replica(model, &self.node_id)
            .unwrap_or(ReplicaRecord {
                model: model.clone(),
                node: self.node_id.clone(),
                status,
                bytes_transferred: 0,
                last_verified_ms: 0,
                error: None,
                source_hint: None,
            });
        replica.status = status;
        replica.bytes_transferred = bytes_transferred;
        replica.error = error;
        if status == ReplicaStatus::Ready {
            replica.last_verified_ms = now_ms();
        }
        self.propose_replica(&replica).await
    }

    // --- EnsureLocal ---

    /// Idempotent: if this node already has a ready replica the call
    /// returns immediately; otherwise it selects a source, transfers the
    /// missing chunks, feeds the engine, and resolves when the replica is
    /// ready.
    pub async fn ensure_local(self: &Arc<Self>, model: &ModelId) -> Result<(), MeshError> {
        if self
            .store
            .replica(model, &self.node_id)
            .is_some_and(|r| r.status == ReplicaStatus::Ready)
        {
            return Ok(());
        }
        let Some(record) = self.store.model(model) else {
            return Err(MeshError::NotFound(format!("model {model}")));
        };

        // Single transfer per model per node.
        if self.inflight.insert(model.clone(), ()).is_some() {
            return Err(MeshError::InvalidRequest(format!(
                "transfer of {model} already in progress"
            )));
        }
        let result = self.transfer_and_activate(&record).await;
        self.inflight.remove(model);
        self.active_transfers.remove(model);
        self.cancels.remove(model);

        match &result {
            Ok(()) => {
                self.retries.remove(model);
            }
            Err(e) => {
                self.note_failure(model);
                warn!("EnsureLocal for {model} failed: {e}");
            }
        }
        result
    }

    fn note_failure(&self, model: &ModelId) {
        let mut entry = self.retries.entry(model.clone()).or_insert(RetryState {
            attempts: 0,
            not_before: Instant::now(),
        });
        entry.attempts += 1;
        let backoff = self
            .cfg
            .backoff_base_ms
            .saturating_mul(1u64 << entry.attempts.min(20))
            .min(self.cfg.backoff_cap_ms);
        entry.not_before = Instant::now() + Duration::from_millis(backoff);
    }

    /// Whether the retry budget allows another attempt right now. Past the
    /// cap the model waits for the next reconcile event.
    fn may_retry(&self, model: &ModelId) -> bool {
        match self.retries.get(model) {
            Some(state) => state.attempts < self.cfg.retry_cap && Instant::now() >= state.not_before,
            None => true,
        }
    }

    /// Clears the retry budget; called when the reconciler re-plans a
    /// placement.
    fn reset_retries(&self, model: &ModelId) {
        self.retries.remove(model);
    }

    async fn transfer_and_activate(self: &Arc<Self>, record: &ModelRecord) -> Result<(), MeshError> {
        let model = &record.id;
        let replica = self.store.replica(model, &self.node_id);
        let source_hint = replica.as_ref().and_then(|r| r.source_hint.clone());

        let nodes = self.store.nodes();
        let replicas = self.store.replicas_of(model);
        let source = source_hint
            .filter(|hint| {
                replicas
                    .iter()
                    .any(|r| r.node == *hint && r.status == ReplicaStatus::Ready)
            })
            .or_else(|| {
                placement::select_source(&replicas, &nodes, &self.zone, &self.node_id)
            })
            .ok_or_else(|| MeshError::SourceUnavailable(model.clone()))?;

        let _permit = self
            .inbound
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MeshError::Aborted)?;

        self.set_replica_status(model, ReplicaStatus::Transferring, 0, None)
            .await?;

        let progress = Arc::new(TransferProgress {
            model: model.clone(),
            source: source.clone(),
            total_bytes: record.size,
            bytes: AtomicU64::new(0),
            started_ms: now_ms(),
        });
        self.active_transfers
            .insert(model.clone(), progress.clone());
        crate::core::metrics::TRANSFERS_ACTIVE.set(self.active_transfers.len() as i64);

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancels.insert(model.clone(), cancel_tx);

        info!("Transferring {model} from {source}");
        let session = self.transport.connect(&source).await?;
        let stream = session.open_stream(ProtocolId::ChunkTransfer).await?;

        let fetch = transfer::fetch_missing(stream, record, &self.cas, &progress.bytes);
        let outcome = tokio::select! {
            result = fetch => result,
            _ = cancel_rx.changed() => Err(MeshError::SourceUnavailable(model.clone())),
        };
        crate::core::metrics::TRANSFERS_ACTIVE
            .set(self.active_transfers.len().saturating_sub(1) as i64);

        match outcome {
            Ok(()) => {}
            Err(e) => {
                let _ = self
                    .set_replica_status(
                        model,
                        ReplicaStatus::Error,
                        progress.bytes.load(Ordering::Relaxed),
                        Some(e.reason().to_string()),
                    )
                    .await;
                return Err(e);
            }
        }

        // Bytes are local and verified; hand them to the engine.
        if let Err(e) = self.activate_local(record).await {
            let _ = self
                .set_replica_status(
                    model,
                    ReplicaStatus::Error,
                    record.size,
                    Some(e.reason().to_string()),
                )
                .await;
            return Err(e);
        }

        self.manifests.save(record).await?;
        self.set_replica_status(model, ReplicaStatus::Ready, record.size, None)
            .await?;
        info!("Replica of {model} is ready");
        Ok(())
    }

    /// Materializes the artifact files into the engine's model directory
    /// and waits for the engine to list the model.
    async fn activate_local(&self, record: &ModelRecord) -> Result<(), MeshError> {
        self.materialize_files(record).await?;
        // The engine finds the files locally; pull is how it (re)loads.
        match self.engine.pull(&record.name).await {
            Ok(resp) => {
                // Drain the progress stream; completion is observed via tags.
                let _ = resp.bytes().await;
            }
            Err(e) => debug!("Engine pull for {} reported: {e}", record.name),
        }
        self.engine.wait_ready(&record.name).await
    }

    /// Writes the artifact's file layout from CAS chunks. Walks chunks and
    /// file ranges in one pass; memory use is bounded by one chunk.
    async fn materialize_files(&self, record: &ModelRecord) -> Result<(), MeshError> {
        let dir = self.artifact_dir(&record.id);
        tokio::fs::create_dir_all(&dir).await?;

        for file in &record.files {
            let path = dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = dir.join(format!(".{}.partial", sanitize_model_id(&file.path)));
            let mut out = tokio::fs::File::create(&tmp).await?;

            let file_end = file.offset + file.length;
            for chunk in &record.chunks {
                let chunk_end = chunk.offset + chunk.length as u64;
                if chunk_end <= file.offset || chunk.offset >= file_end {
                    continue;
                }
                let bytes = self
                    .cas
                    .get_verified(&chunk.digest)
                    .await?
                    .ok_or_else(|| MeshError::IntegrityFailed {
                        model: record.id.clone(),
                        detail: format!("chunk {} vanished during materialize", chunk.index),
                    })?;
                let start = file.offset.saturating_sub(chunk.offset) as usize;
                let end = (file_end.min(chunk_end) - chunk.offset) as usize;
                out.write_all(&bytes[start..end]).await?;
            }
            out.sync_all().await?;
            drop(out);
            tokio::fs::rename(&tmp, &path).await?;
        }
        Ok(())
    }

    // --- Origin publication (client pull landed on this node) ---

    /// Imports the artifact the engine materialized for `name`, publishes
    /// the model descriptor plus its default policy, and records this
    /// node's replica as ready.
    pub async fn publish_from_engine(
        self: &Arc<Self>,
        model_id: &ModelId,
        family: &str,
    ) -> Result<ModelRecord, MeshError> {
        if let Some(existing) = self.store.model(model_id) {
            // Already published; just make sure we hold a ready replica.
            self.ensure_local(model_id).await?;
            return Ok(existing);
        }

        let dir = self.artifact_dir(model_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(MeshError::NotFound(format!(
                "engine produced no artifact directory at {}",
                dir.display()
            )));
        }

        let (chunks, files, size) = self.import_artifact_dir(&dir).await?;
        if chunks.is_empty() {
            return Err(MeshError::InvalidRequest(format!(
                "artifact directory {} is empty",
                dir.display()
            )));
        }

        let (name, version) = match model_id.rsplit_once(':') {
            Some((name, version)) => (name.to_string(), version.to_string()),
            None => (model_id.clone(), "latest".to_string()),
        };
        let record = manifest::build_record(
            model_id.clone(),
            name,
            version,
            family.to_string(),
            size,
            chunks,
            files,
        );

        self.proposer
            .propose(LogRecord::Put {
                key: keys::model_key(model_id),
                value: to_wire(&record)?,
            })
            .await?;

        if self.store.policy(model_id).is_none() {
            let policy = ReplicationPolicy {
                model: model_id.clone(),
                min: self.cfg.replication_min,
                max: self.cfg.replication_max,
                strategy: self.cfg.default_strategy.into(),
            };
            self.proposer
                .propose(LogRecord::Put {
                    key: keys::policy_key(model_id),
                    value: to_wire(&policy)?,
                })
                .await?;
        }

        self.manifests.save(&record).await?;
        self.set_replica_status(model_id, ReplicaStatus::Ready, size, None)
            .await?;
        info!(
            "Published model {model_id}: {} bytes in {} chunks",
            record.size,
            record.chunks.len()
        );
        Ok(record)
    }

    /// Chunks every regular file under `dir` (sorted by relative path) into
    /// the content store as one concatenated artifact.
    async fn import_artifact_dir(
        &self,
        dir: &PathBuf,
    ) -> Result<(Vec<ChunkInfo>, Vec<FileEntry>, u64), MeshError> {
        let mut paths = Vec::new();
        let mut stack = vec![dir.clone()];
        while let Some(current) = stack.pop() {
            let mut rd = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = rd.next_entry().await? {
                let ty = entry.file_type().await?;
                if ty.is_dir() {
                    stack.push(entry.path());
                } else if ty.is_file() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.starts_with('.') {
                        paths.push(entry.path());
                    }
                }
            }
        }
        paths.sort();

        let chunk_size = self.cfg.chunk_size.max(1);
        let mut chunks: Vec<ChunkInfo> = Vec::new();
        let mut files: Vec<FileEntry> = Vec::new();
        let mut carry: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut artifact_offset = 0u64;

        for path in paths {
            let rel = path
                .strip_prefix(dir)
                .map_err(|_| MeshError::Internal("artifact path outside dir".to_string()))?
                .to_string_lossy()
                .into_owned();
            let mut file = tokio::fs::File::open(&path).await?;
            let mut file_len = 0u64;
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                file_len += n as u64;
                carry.extend_from_slice(&buf[..n]);
                while carry.len() >= chunk_size {
                    let piece: Vec<u8> = carry.drain(..chunk_size).collect();
                    self.push_chunk(&mut chunks, piece).await?;
                }
            }
            files.push(FileEntry {
                path: rel,
                offset: artifact_offset,
                length: file_len,
            });
            artifact_offset += file_len;
        }
        if !carry.is_empty() {
            let piece = std::mem::take(&mut carry);
            self.push_chunk(&mut chunks, piece).await?;
        }
        Ok((chunks, files, artifact_offset))
    }

    async fn push_chunk(
        &self,
        chunks: &mut Vec<ChunkInfo>,
        piece: Vec<u8>,
    ) -> Result<(), MeshError> {
        let digest = crate::core::distribution::cas::digest_of(&piece);
        self.cas.put(&digest, &piece).await?;
        let offset = chunks
            .last()
            .map(|c| c.offset + c.length as u64)
            .unwrap_or(0);
        chunks.push(ChunkInfo {
            index: chunks.len() as u32,
            offset,
            length: piece.len() as u32,
            digest,
        });
        Ok(())
    }

    // --- Verify ---

    /// Recomputes every chunk digest and the root from disk. On mismatch
    /// the replica is marked error, offending chunks are dropped, and a
    /// redownload is kicked off.
    pub async fn verify(self: &Arc<Self>, model: &ModelId) -> Result<(), MeshError> {
        let Some(record) = self.store.model(model) else {
            return Err(MeshError::NotFound(format!("model {model}")));
        };
        let mut bad = Vec::new();
        for chunk in &record.chunks {
            match self.cas.get(&chunk.digest).await? {
                Some(bytes) => {
                    if crate::core::distribution::cas::digest_of(&bytes) != chunk.digest {
                        bad.push(chunk.digest.clone());
                    }
                }
                None => bad.push(chunk.digest.clone()),
            }
        }
        let root = manifest::merkle_root(&record.chunks);
        if bad.is_empty() && root == record.root_digest {
            self.set_replica_status(model, ReplicaStatus::Ready, record.size, None)
                .await?;
            return Ok(());
        }

        crate::core::metrics::INTEGRITY_FAILURES_TOTAL.inc();
        for digest in &bad {
            let _ = self.cas.remove(digest).await;
        }
        let e = MeshError::IntegrityFailed {
            model: model.clone(),
            detail: format!("{} chunks failed verification", bad.len()),
        };
        self.set_replica_status(
            model,
            ReplicaStatus::Error,
            0,
            Some(e.reason().to_string()),
        )
        .await?;

        // Redownload what was dropped.
        self.reset_retries(model);
        let manager = self.clone();
        let model = model.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.ensure_local(&model).await {
                warn!("Redownload of {model} after verify failure: {e}");
            }
        });
        Err(e)
    }

    // --- Local deletion ---

    pub async fn delete_local(&self, model: &ModelId) -> Result<(), MeshError> {
        if let Some(record) = self.store.model(model).or(self.manifests.load(model).await?) {
            let _ = self.engine.delete(&record.name).await;
        }
        let _ = tokio::fs::remove_dir_all(self.artifact_dir(model)).await;
        self.manifests.remove(model).await?;
        // Shared chunks stay; GC reclaims them once no manifest refers.
        let _ = self.gc_unreferenced_chunks().await;
        Ok(())
    }

    /// Cluster-wide model removal: every replica record, the policy, and
    /// finally the descriptor leave the log. Holders observe the removal
    /// and clean up locally.
    pub async fn delete_model(&self, model: &ModelId) -> Result<(), MeshError> {
        if self.store.model(model).is_none() {
            return Err(MeshError::NotFound(format!("model {model}")));
        }
        for replica in self.store.replicas_of(model) {
            self.proposer
                .propose(LogRecord::Delete {
                    key: keys::replica_key(model, &replica.node),
                })
                .await?;
        }
        self.proposer
            .propose(LogRecord::Delete {
                key: keys::policy_key(model),
            })
            .await?;
        self.proposer
            .propose(LogRecord::Delete {
                key: keys::model_key(model),
            })
            .await?;
        Ok(())
    }

    // --- Event watcher ---

    /// Reacts to replica and node events: starts transfers assigned to this
    /// node, cleans up removed replicas, and cancels transfers whose source
    /// went down. The periodic tick re-arms placements that exhausted their
    /// retry budget, bounding the retry rate at one per reconcile interval.
    pub async fn run_watcher(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut replica_rx = self.store.subscribe(StateTopic::Replica);
        let mut node_rx = self.store.subscribe(StateTopic::Node);
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.cfg.reconcile_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Distribution watcher shutting down.");
                    return;
                }
                Some(event) = replica_rx.recv() => self.handle_replica_event(event),
                Some(event) = node_rx.recv() => self.handle_node_event(event),
                _ = tick.tick() => {
                    for replica in self.store.replicas_on(&self.node_id) {
                        if replica.status == ReplicaStatus::Pending
                            && !self.inflight.contains_key(&replica.model)
                        {
                            self.reset_retries(&replica.model);
                            self.kick_ensure(&replica.model);
                        }
                    }
                }
            }
        }
    }

    fn handle_replica_event(self: &Arc<Self>, event: StateEvent) {
        match event {
            StateEvent::ReplicaUpdated(replica) if replica.node == self.node_id => {
                match replica.status {
                    ReplicaStatus::Pending => self.kick_ensure(&replica.model),
                    ReplicaStatus::Deleted => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.delete_local(&replica.model).await {
                                warn!("Local delete of {} failed: {e}", replica.model);
                            }
                            let _ = manager
                                .proposer
                                .propose(LogRecord::Delete {
                                    key: keys::replica_key(&replica.model, &manager.node_id),
                                })
                                .await;
                        });
                    }
                    _ => {}
                }
            }
            StateEvent::ReplicaRemoved { model, node } if node == self.node_id => {
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.delete_local(&model).await {
                        warn!("Local delete of {model} failed: {e}");
                    }
                });
            }
            StateEvent::Lagged => {
                // Resync: anything pending for us restarts its transfer.
                for replica in self.store.replicas_on(&self.node_id) {
                    if replica.status == ReplicaStatus::Pending {
                        self.kick_ensure(&replica.model);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_node_event(self: &Arc<Self>, event: StateEvent) {
        if let StateEvent::NodeUpdated(node) = event {
            if node.state == NodeLifecycle::Down {
                // Cancel in-flight transfers sourced from the downed node;
                // the next attempt re-sources.
                for entry in self.active_transfers.iter() {
                    if entry.value().source == node.id {
                        if let Some(cancel) = self.cancels.get(entry.key()) {
                            let _ = cancel.value().send(true);
                        }
                        self.reset_retries(entry.key());
                    }
                }
            }
        }
    }

    fn kick_ensure(self: &Arc<Self>, model: &ModelId) {
        if !self.may_retry(model) {
            debug!("Transfer of {model} is backing off");
            return;
        }
        let manager = self.clone();
        let model = model.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.ensure_local(&model).await {
                debug!("Deferred transfer of {model}: {e}");
            }
        });
    }

    /// Digest over the sorted list of locally-ready models, published in
    /// heartbeats so peers can spot divergence cheaply.
    pub fn models_digest(&self) -> String {
        let mut ready: Vec<ModelId> = self
            .store
            .replicas_on(&self.node_id)
            .into_iter()
            .filter(|r| r.status == ReplicaStatus::Ready)
            .map(|r| r.model)
            .collect();
        ready.sort();
        let mut hasher = Sha256::new();
        for model in &ready {
            hasher.update(model.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Reconciler hook: re-plan placements for a model, resetting backoff.
    pub fn notify_replanned(&self, model: &ModelId) {
        self.reset_retries(model);
    }
}
