// src/core/distribution/manifest.rs

//! Model manifests: the chunk list, file layout, and Merkle root of an
//! artifact, persisted as JSON beside the data directory so a restart can
//! verify local replicas without the cluster.

use crate::core::distribution::cas::{ChunkStore, digest_of};
use crate::core::fsutil;
use crate::core::state::types::{ChunkInfo, FileEntry, ModelRecord};
use crate::core::{MeshError, ModelId};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Merkle root over the ordered chunk digests.
pub fn merkle_root(chunks: &[ChunkInfo]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Filesystem-safe directory name for a model id. Ids may contain path
/// separators and colons; a digest suffix keeps sanitized names unique.
pub fn sanitize_model_id(id: &ModelId) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let suffix = &digest_of(id.as_bytes())[..8];
    format!("{cleaned}-{suffix}")
}

/// Splits an artifact into content-addressed chunks and stores them.
pub async fn chunk_into_store(
    cas: &ChunkStore,
    data: &[u8],
    chunk_size: usize,
) -> Result<Vec<ChunkInfo>, MeshError> {
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    for (index, piece) in data.chunks(chunk_size.max(1)).enumerate() {
        let digest = digest_of(piece);
        cas.put(&digest, piece).await?;
        chunks.push(ChunkInfo {
            index: index as u32,
            offset,
            length: piece.len() as u32,
            digest,
        });
        offset += piece.len() as u64;
    }
    Ok(chunks)
}

/// Builds the immutable model descriptor for an artifact already chunked
/// into the store.
pub fn build_record(
    id: ModelId,
    name: String,
    version: String,
    family: String,
    size: u64,
    chunks: Vec<ChunkInfo>,
    files: Vec<FileEntry>,
) -> ModelRecord {
    let root_digest = merkle_root(&chunks);
    ModelRecord {
        id,
        name,
        version,
        family,
        size,
        chunks,
        files,
        root_digest,
    }
}

/// Recomputes every chunk digest from disk and the root over them. Returns
/// the first failure found, if any.
pub async fn verify_on_disk(
    cas: &ChunkStore,
    record: &ModelRecord,
) -> Result<(), MeshError> {
    for chunk in &record.chunks {
        match cas.get(&chunk.digest).await? {
            Some(bytes) => {
                let actual = digest_of(&bytes);
                if actual != chunk.digest {
                    return Err(MeshError::IntegrityFailed {
                        model: record.id.clone(),
                        detail: format!(
                            "chunk {} content hashes to {actual}, expected {}",
                            chunk.index, chunk.digest
                        ),
                    });
                }
            }
            None => {
                return Err(MeshError::IntegrityFailed {
                    model: record.id.clone(),
                    detail: format!("chunk {} missing from local store", chunk.index),
                });
            }
        }
    }
    let root = merkle_root(&record.chunks);
    if root != record.root_digest {
        return Err(MeshError::IntegrityFailed {
            model: record.id.clone(),
            detail: format!("root digest {root} does not match {}", record.root_digest),
        });
    }
    Ok(())
}

/// Local persistence for manifests at `<data_dir>/models/<id>/manifest.json`.
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("models"),
        }
    }

    fn manifest_path(&self, id: &ModelId) -> PathBuf {
        self.root.join(sanitize_model_id(id)).join("manifest.json")
    }

    pub async fn save(&self, record: &ModelRecord) -> Result<(), MeshError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        fsutil::write_atomic(&self.manifest_path(&record.id), &bytes).await?;
        Ok(())
    }

    pub async fn load(&self, id: &ModelId) -> Result<Option<ModelRecord>, MeshError> {
        match tokio::fs::read(self.manifest_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(&self, id: &ModelId) -> Result<(), MeshError> {
        let dir = self.root.join(sanitize_model_id(id));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every manifest currently on disk; used by startup GC and verify.
    pub async fn list(&self) -> Result<Vec<ModelRecord>, MeshError> {
        let mut records = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dirs.next_entry().await? {
            let path = entry.path().join("manifest.json");
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Corrupt manifest at {:?}: {e}", path),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }
}
