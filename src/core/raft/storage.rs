// src/core/raft/storage.rs

//! Durable storage for the consensus log: hard state, segmented log files,
//! and snapshots. Every durable write is temp + fsync + rename; a torn tail
//! on the newest segment is tolerated and truncated at open.

use crate::core::fsutil;
use crate::core::raft::msg::{Entry, HardState, Membership};
use crate::core::transport::framing::{from_wire, to_wire};
use crate::core::MeshError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const META_FILE: &str = "meta.json";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_META_FILE: &str = "snapshot.meta.json";
const WAL_DIR: &str = "wal";
const SEGMENT_MAX_BYTES: u64 = 16 * 1024 * 1024;

/// What the latest snapshot covers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
    pub membership: Membership,
}

/// The durable log plus its in-memory image of the unsnapshotted suffix.
pub struct LogStore {
    dir: PathBuf,
    wal_dir: PathBuf,
    hard_state: HardState,
    snapshot_meta: Option<SnapshotMeta>,
    /// Index of the entry preceding `entries[0]`.
    offset: u64,
    entries: Vec<Entry>,
    active: Option<ActiveSegment>,
    /// Entries applied since the last snapshot, for compaction triggering.
    appended_since_snapshot: u64,
}

struct ActiveSegment {
    path: PathBuf,
    file: fs::File,
    bytes: u64,
}

fn segment_path(wal_dir: &Path, first_index: u64) -> PathBuf {
    wal_dir.join(format!("seg-{first_index:020}.log"))
}

fn frame_entry(entry: &Entry) -> Result<Vec<u8>, MeshError> {
    let body = to_wire(entry)?;
    let mut framed = Vec::with_capacity(body.len() + 4);
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

impl LogStore {
    /// Opens (or initializes) the log at `<data_dir>/raft`.
    pub fn open(data_dir: &Path) -> Result<Self, MeshError> {
        let dir = data_dir.join("raft");
        let wal_dir = dir.join(WAL_DIR);
        fs::create_dir_all(&wal_dir)?;

        let hard_state = match fs::read(dir.join(META_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| MeshError::Fatal(format!("corrupt raft metadata: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(MeshError::Fatal(format!("cannot read raft metadata: {e}"))),
        };

        let snapshot_meta: Option<SnapshotMeta> = match fs::read(dir.join(SNAPSHOT_META_FILE)) {
            Ok(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| MeshError::Fatal(format!("corrupt snapshot metadata: {e}")))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(MeshError::Fatal(format!(
                    "cannot read snapshot metadata: {e}"
                )));
            }
        };

        let offset = snapshot_meta.as_ref().map(|m| m.last_index).unwrap_or(0);
        let mut store = Self {
            dir,
            wal_dir,
            hard_state,
            snapshot_meta,
            offset,
            entries: Vec::new(),
            active: None,
            appended_since_snapshot: 0,
        };
        store.replay_segments()?;
        info!(
            "Raft log opened: term={}, last_index={}, snapshot_at={}",
            store.hard_state.current_term,
            store.last_index(),
            store.offset
        );
        Ok(store)
    }

    fn replay_segments(&mut self) -> Result<(), MeshError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.wal_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
            .collect();
        paths.sort();

        let total = paths.len();
        for (i, path) in paths.iter().enumerate() {
            let is_last = i + 1 == total;
            let mut file = fs::File::open(path)?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            let mut pos = 0usize;
            while pos + 4 <= buf.len() {
                let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                if pos + 4 + len > buf.len() {
                    if is_last {
                        warn!(
                            "Torn tail in {}; truncating at byte {}",
                            path.display(),
                            pos
                        );
                        break;
                    }
                    return Err(MeshError::Fatal(format!(
                        "torn frame in non-final segment {}",
                        path.display()
                    )));
                }
                let entry: Entry = match from_wire(&buf[pos + 4..pos + 4 + len]) {
                    Ok(e) => e,
                    Err(e) => {
                        if is_last {
                            warn!("Undecodable tail in {}: {e}; truncating", path.display());
                            break;
                        }
                        return Err(MeshError::Fatal(format!(
                            "corrupt entry in {}: {e}",
                            path.display()
                        )));
                    }
                };
                pos += 4 + len;

                if entry.index <= self.offset {
                    continue;
                }
                // An overlapping rewrite left behind by a crash: the later
                // file wins from its first index onward.
                let expected = self.offset + self.entries.len() as u64 + 1;
                if entry.index < expected {
                    self.entries
                        .truncate((entry.index - self.offset - 1) as usize);
                } else if entry.index > expected {
                    return Err(MeshError::Fatal(format!(
                        "log gap: expected index {expected}, found {}",
                        entry.index
                    )));
                }
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    pub fn save_hard_state(&mut self, hs: HardState) -> Result<(), MeshError> {
        if hs == self.hard_state {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&hs)?;
        fsutil::write_atomic_sync(&self.dir.join(META_FILE), &bytes)?;
        self.hard_state = hs;
        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.offset + 1
    }

    pub fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .or_else(|| self.snapshot_meta.as_ref().map(|m| m.last_term))
            .unwrap_or(0)
    }

    /// Term at an index, if still known. Index 0 is the empty-log sentinel.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.offset {
            return self.snapshot_meta.as_ref().map(|m| m.last_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&Entry> {
        if index <= self.offset {
            return None;
        }
        self.entries.get((index - self.offset - 1) as usize)
    }

    pub fn entries_from(&self, from: u64, max: u64) -> Vec<Entry> {
        if from <= self.offset {
            return Vec::new();
        }
        let start = (from - self.offset - 1) as usize;
        self.entries
            .iter()
            .skip(start)
            .take(max as usize)
            .cloned()
            .collect()
    }

    /// Appends entries and makes them durable before returning.
    pub fn append(&mut self, new_entries: &[Entry]) -> Result<(), MeshError> {
        if new_entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in new_entries {
            buf.extend_from_slice(&frame_entry(entry)?);
        }

        let rotate = match &self.active {
            Some(active) => active.bytes >= SEGMENT_MAX_BYTES,
            None => true,
        };
        if rotate {
            let first = new_entries[0].index;
            let path = segment_path(&self.wal_dir, first);
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            self.active = Some(ActiveSegment {
                path,
                file,
                bytes: 0,
            });
        }

        let active = self.active.as_mut().expect("active segment after rotate");
        active.file.write_all(&buf)?;
        active.file.sync_data()?;
        active.bytes += buf.len() as u64;

        self.entries.extend_from_slice(new_entries);
        self.appended_since_snapshot += new_entries.len() as u64;
        Ok(())
    }

    /// Drops every entry at or after `index` (conflict resolution) and
    /// rewrites the remaining suffix durably.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), MeshError> {
        if index > self.last_index() {
            return Ok(());
        }
        if index <= self.offset {
            return Err(MeshError::Fatal(format!(
                "cannot truncate into snapshotted prefix at {index}"
            )));
        }
        self.entries.truncate((index - self.offset - 1) as usize);
        self.rewrite_wal()
    }

    fn rewrite_wal(&mut self) -> Result<(), MeshError> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend_from_slice(&frame_entry(entry)?);
        }
        let first = self.offset + 1;
        let target = segment_path(&self.wal_dir, first);
        fsutil::write_atomic_sync(&target, &buf)?;

        // All other segments are now stale.
        for dirent in fs::read_dir(&self.wal_dir)? {
            let path = dirent?.path();
            if path != target && path.extension().is_some_and(|ext| ext == "log") {
                let _ = fs::remove_file(&path);
            }
        }

        let file = fs::OpenOptions::new().append(true).open(&target)?;
        self.active = Some(ActiveSegment {
            path: target,
            file,
            bytes: buf.len() as u64,
        });
        Ok(())
    }

    pub fn snapshot_meta(&self) -> Option<&SnapshotMeta> {
        self.snapshot_meta.as_ref()
    }

    pub fn load_snapshot_data(&self) -> Result<Option<Vec<u8>>, MeshError> {
        match fs::read(self.dir.join(SNAPSHOT_FILE)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MeshError::Fatal(format!("cannot read snapshot: {e}"))),
        }
    }

    /// Persists a snapshot image, then compacts the log below it. Deleted
    /// keys' tombstones vanish here: the snapshot holds only live state.
    pub fn save_snapshot(&mut self, meta: SnapshotMeta, data: &[u8]) -> Result<(), MeshError> {
        fsutil::write_atomic_sync(&self.dir.join(SNAPSHOT_FILE), data)?;
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        fsutil::write_atomic_sync(&self.dir.join(SNAPSHOT_META_FILE), &meta_bytes)?;

        if meta.last_index > self.offset {
            let drop_count = (meta.last_index - self.offset).min(self.entries.len() as u64);
            self.entries.drain(..drop_count as usize);
            self.offset = meta.last_index;
        }
        self.snapshot_meta = Some(meta);
        self.appended_since_snapshot = 0;
        self.rewrite_wal()
    }

    pub fn appended_since_snapshot(&self) -> u64 {
        self.appended_since_snapshot
    }
}
