// src/core/distribution/cas.rs

//! The on-disk content-addressed chunk store. Chunks are keyed by their
//! SHA-256 digest under `<data_dir>/cas/<hex-prefix>/<digest>`, so repeated
//! transfers and models sharing bytes deduplicate. Writes are temp + fsync
//! + rename; reads are lock-free.

use crate::core::MeshError;
use crate::core::fsutil;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ENOSPC: i32 = 28;

pub struct ChunkStore {
    root: PathBuf,
}

/// SHA-256 of a byte slice, hex-encoded: the cluster's chunk identity.
pub fn digest_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn map_write_err(e: std::io::Error) -> MeshError {
    if e.raw_os_error() == Some(ENOSPC) {
        MeshError::StorageFull
    } else {
        e.into()
    }
}

impl ChunkStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("cas"),
        }
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        let prefix = digest.get(..2).unwrap_or("00");
        self.root.join(prefix).join(digest)
    }

    pub async fn contains(&self, digest: &str) -> bool {
        tokio::fs::try_exists(self.path_for(digest))
            .await
            .unwrap_or(false)
    }

    /// Stores a chunk after verifying its content matches the digest.
    pub async fn put(&self, digest: &str, bytes: &[u8]) -> Result<(), MeshError> {
        let actual = digest_of(bytes);
        if actual != digest {
            return Err(MeshError::IntegrityFailed {
                model: String::new(),
                detail: format!("chunk digest mismatch: expected {digest}, got {actual}"),
            });
        }
        let path = self.path_for(digest);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        fsutil::write_atomic(&path, bytes)
            .await
            .map_err(map_write_err)
    }

    pub async fn get(&self, digest: &str) -> Result<Option<Vec<u8>>, MeshError> {
        match tokio::fs::read(self.path_for(digest)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads a chunk and confirms its content still hashes to its name.
    pub async fn get_verified(&self, digest: &str) -> Result<Option<Vec<u8>>, MeshError> {
        let Some(bytes) = self.get(digest).await? else {
            return Ok(None);
        };
        let actual = digest_of(&bytes);
        if actual != digest {
            return Err(MeshError::IntegrityFailed {
                model: String::new(),
                detail: format!("on-disk chunk {digest} hashes to {actual}"),
            });
        }
        Ok(Some(bytes))
    }

    pub async fn remove(&self, digest: &str) -> Result<(), MeshError> {
        match tokio::fs::remove_file(self.path_for(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every chunk not referenced by any manifest. A chunk's
    /// lifetime is the longest-held replica that references it.
    pub async fn gc(&self, referenced: &HashSet<String>) -> Result<usize, MeshError> {
        let mut removed = 0usize;
        let mut prefixes = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(prefix_entry) = prefixes.next_entry().await? {
            let mut chunks = match tokio::fs::read_dir(prefix_entry.path()).await {
                Ok(rd) => rd,
                Err(e) => {
                    warn!("Cannot scan CAS prefix {:?}: {e}", prefix_entry.path());
                    continue;
                }
            };
            while let Some(chunk_entry) = chunks.next_entry().await? {
                let name = chunk_entry.file_name().to_string_lossy().into_owned();
                if !referenced.contains(&name) {
                    debug!("GC removing unreferenced chunk {name}");
                    if tokio::fs::remove_file(chunk_entry.path()).await.is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}
