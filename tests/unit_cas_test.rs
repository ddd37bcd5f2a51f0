use infermesh::MeshError;
use infermesh::core::distribution::cas::{ChunkStore, digest_of};
use std::collections::HashSet;

#[tokio::test]
async fn test_put_and_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let bytes = b"chunk contents".to_vec();
    let digest = digest_of(&bytes);

    cas.put(&digest, &bytes).await.unwrap();
    assert!(cas.contains(&digest).await);
    assert_eq!(cas.get(&digest).await.unwrap().unwrap(), bytes);
}

#[tokio::test]
async fn test_put_rejects_digest_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let err = cas.put(&digest_of(b"other"), b"chunk").await.unwrap_err();
    assert!(matches!(err, MeshError::IntegrityFailed { .. }));
}

#[tokio::test]
async fn test_put_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let bytes = b"same bytes".to_vec();
    let digest = digest_of(&bytes);
    cas.put(&digest, &bytes).await.unwrap();
    cas.put(&digest, &bytes).await.unwrap();
    assert_eq!(cas.get(&digest).await.unwrap().unwrap(), bytes);
}

#[tokio::test]
async fn test_get_verified_detects_on_disk_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let bytes = b"soon to be corrupted".to_vec();
    let digest = digest_of(&bytes);
    cas.put(&digest, &bytes).await.unwrap();

    // Flip the file contents under the same name.
    let path = dir
        .path()
        .join("cas")
        .join(&digest[..2])
        .join(&digest);
    tokio::fs::write(&path, b"garbage").await.unwrap();

    let err = cas.get_verified(&digest).await.unwrap_err();
    assert!(matches!(err, MeshError::IntegrityFailed { .. }));
}

#[tokio::test]
async fn test_gc_removes_only_unreferenced_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());

    let keep = b"keep me".to_vec();
    let drop = b"drop me".to_vec();
    let keep_digest = digest_of(&keep);
    let drop_digest = digest_of(&drop);
    cas.put(&keep_digest, &keep).await.unwrap();
    cas.put(&drop_digest, &drop).await.unwrap();

    let referenced: HashSet<String> = [keep_digest.clone()].into_iter().collect();
    let removed = cas.gc(&referenced).await.unwrap();
    assert_eq!(removed, 1);
    assert!(cas.contains(&keep_digest).await);
    assert!(!cas.contains(&drop_digest).await);
}

#[tokio::test]
async fn test_missing_chunk_reads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    assert!(cas.get(&digest_of(b"never stored")).await.unwrap().is_none());
}
