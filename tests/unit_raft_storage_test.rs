use infermesh::core::raft::storage::{LogStore, SnapshotMeta};
use infermesh::core::raft::{Entry, HardState, LogRecord, Membership};
use std::collections::BTreeSet;

fn entry(term: u64, index: u64, key: &str) -> Entry {
    Entry {
        term,
        index,
        record: LogRecord::Put {
            key: key.as_bytes().to_vec(),
            value: b"v".to_vec(),
        },
    }
}

#[tokio::test]
async fn test_empty_log_opens_clean() {
    let dir = tempfile::tempdir().unwrap();
    let store = LogStore::open(dir.path()).unwrap();
    assert_eq!(store.last_index(), 0);
    assert_eq!(store.last_term(), 0);
    assert_eq!(store.term_at(0), Some(0));
    assert_eq!(store.hard_state(), &HardState::default());
}

#[tokio::test]
async fn test_append_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open(dir.path()).unwrap();
    store
        .append(&[entry(1, 1, "a"), entry(1, 2, "b"), entry(2, 3, "c")])
        .unwrap();
    assert_eq!(store.last_index(), 3);
    assert_eq!(store.last_term(), 2);
    assert_eq!(store.term_at(2), Some(1));
    let entries = store.entries_from(2, 10);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].index, 2);
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&[entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();
        store
            .save_hard_state(HardState {
                current_term: 4,
                voted_for: Some("n2".to_string()),
            })
            .unwrap();
    }
    let store = LogStore::open(dir.path()).unwrap();
    assert_eq!(store.last_index(), 2);
    assert_eq!(store.hard_state().current_term, 4);
    assert_eq!(store.hard_state().voted_for.as_deref(), Some("n2"));
}

#[tokio::test]
async fn test_truncate_from_discards_suffix_durably() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = LogStore::open(dir.path()).unwrap();
        store
            .append(&[entry(1, 1, "a"), entry(1, 2, "b"), entry(1, 3, "c")])
            .unwrap();
        store.truncate_from(2).unwrap();
        assert_eq!(store.last_index(), 1);
        // New entries append after the truncation point.
        store.append(&[entry(2, 2, "b2")]).unwrap();
    }
    let store = LogStore::open(dir.path()).unwrap();
    assert_eq!(store.last_index(), 2);
    assert_eq!(store.term_at(2), Some(2));
}

#[tokio::test]
async fn test_snapshot_compacts_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open(dir.path()).unwrap();
    let entries: Vec<Entry> = (1..=10).map(|i| entry(1, i, &format!("k{i}"))).collect();
    store.append(&entries).unwrap();

    let membership = Membership {
        voters: BTreeSet::from(["n1".to_string()]),
        learners: BTreeSet::new(),
    };
    store
        .save_snapshot(
            SnapshotMeta {
                last_index: 7,
                last_term: 1,
                membership: membership.clone(),
            },
            b"image-bytes",
        )
        .unwrap();

    assert_eq!(store.first_index(), 8);
    assert_eq!(store.last_index(), 10);
    assert!(store.entry(7).is_none());
    assert_eq!(store.term_at(7), Some(1));
    assert_eq!(store.load_snapshot_data().unwrap().unwrap(), b"image-bytes");
    assert_eq!(store.snapshot_meta().unwrap().membership, membership);
    assert_eq!(store.appended_since_snapshot(), 0);
}

#[tokio::test]
async fn test_snapshot_and_tail_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = LogStore::open(dir.path()).unwrap();
        let entries: Vec<Entry> = (1..=5).map(|i| entry(1, i, &format!("k{i}"))).collect();
        store.append(&entries).unwrap();
        store
            .save_snapshot(
                SnapshotMeta {
                    last_index: 3,
                    last_term: 1,
                    membership: Membership::default(),
                },
                b"snap",
            )
            .unwrap();
    }
    let store = LogStore::open(dir.path()).unwrap();
    assert_eq!(store.first_index(), 4);
    assert_eq!(store.last_index(), 5);
    assert_eq!(store.load_snapshot_data().unwrap().unwrap(), b"snap");
}

#[tokio::test]
async fn test_torn_tail_is_truncated_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&[entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();
    }
    // Simulate a crash mid-append: garbage frame header at the tail.
    let wal_dir = dir.path().join("raft").join("wal");
    let seg = std::fs::read_dir(&wal_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let mut bytes = std::fs::read(&seg).unwrap();
    bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0x00, 0x01]);
    std::fs::write(&seg, bytes).unwrap();

    let store = LogStore::open(dir.path()).unwrap();
    assert_eq!(store.last_index(), 2);
}
