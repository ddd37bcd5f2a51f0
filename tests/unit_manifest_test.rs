use infermesh::core::distribution::cas::ChunkStore;
use infermesh::core::distribution::manifest::{
    ManifestStore, build_record, chunk_into_store, merkle_root, sanitize_model_id, verify_on_disk,
};
use infermesh::core::state::types::FileEntry;

#[tokio::test]
async fn test_chunking_covers_all_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let data = vec![7u8; 10_000];
    let chunks = chunk_into_store(&cas, &data, 4096).await.unwrap();

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].length, 4096);
    assert_eq!(chunks[1].length, 4096);
    assert_eq!(chunks[2].length, 10_000 - 2 * 4096);
    assert_eq!(chunks[2].offset, 8192);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.index as usize, i);
        assert!(cas.contains(&chunk.digest).await);
    }
}

#[tokio::test]
async fn test_merkle_root_is_order_sensitive() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let data: Vec<u8> = (0..=255u8).cycle().take(9000).collect();
    let chunks = chunk_into_store(&cas, &data, 4096).await.unwrap();

    let root = merkle_root(&chunks);
    let mut reversed = chunks.clone();
    reversed.reverse();
    assert_ne!(root, merkle_root(&reversed));
    // Deterministic for the same input.
    assert_eq!(root, merkle_root(&chunks));
}

#[tokio::test]
async fn test_verify_on_disk_accepts_intact_model() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let data = vec![42u8; 5000];
    let chunks = chunk_into_store(&cas, &data, 2048).await.unwrap();
    let record = build_record(
        "m:1".to_string(),
        "m".to_string(),
        "1".to_string(),
        "llama".to_string(),
        data.len() as u64,
        chunks,
        vec![FileEntry {
            path: "weights.bin".to_string(),
            offset: 0,
            length: data.len() as u64,
        }],
    );
    verify_on_disk(&cas, &record).await.unwrap();
}

#[tokio::test]
async fn test_verify_on_disk_detects_missing_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let data = vec![9u8; 5000];
    let chunks = chunk_into_store(&cas, &data, 2048).await.unwrap();
    let record = build_record(
        "m:1".to_string(),
        "m".to_string(),
        "1".to_string(),
        "llama".to_string(),
        data.len() as u64,
        chunks,
        Vec::new(),
    );

    cas.remove(&record.chunks[1].digest).await.unwrap();
    let err = verify_on_disk(&cas, &record).await.unwrap_err();
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn test_manifest_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cas = ChunkStore::new(dir.path());
    let manifests = ManifestStore::new(dir.path());
    let data = vec![1u8; 1000];
    let chunks = chunk_into_store(&cas, &data, 512).await.unwrap();
    let record = build_record(
        "reg/model:tag".to_string(),
        "reg/model".to_string(),
        "tag".to_string(),
        String::new(),
        data.len() as u64,
        chunks,
        Vec::new(),
    );

    manifests.save(&record).await.unwrap();
    let loaded = manifests.load(&record.id).await.unwrap().unwrap();
    assert_eq!(loaded, record);

    let all = manifests.list().await.unwrap();
    assert_eq!(all.len(), 1);

    manifests.remove(&record.id).await.unwrap();
    assert!(manifests.load(&record.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sanitize_model_id_is_unique_and_path_safe() {
    let a = sanitize_model_id(&"reg/model:tag".to_string());
    let b = sanitize_model_id(&"reg-model:tag".to_string());
    let c = sanitize_model_id(&"reg/model/tag".to_string());
    assert_ne!(a, b);
    assert_ne!(a, c);
    for s in [&a, &b, &c] {
        assert!(
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        );
    }
}
