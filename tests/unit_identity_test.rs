use infermesh::core::identity::{NodeIdentity, verify_node_signature};

#[tokio::test]
async fn test_identity_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let first = NodeIdentity::load_or_generate(dir.path()).unwrap();
    let second = NodeIdentity::load_or_generate(dir.path()).unwrap();
    assert_eq!(first.id(), second.id());
    assert!(dir.path().join("node.key").exists());
    assert!(dir.path().join("node.pub").exists());
}

#[tokio::test]
async fn test_node_id_is_hex_public_key() {
    let dir = tempfile::tempdir().unwrap();
    let identity = NodeIdentity::load_or_generate(dir.path()).unwrap();
    assert_eq!(identity.id().len(), 64);
    assert_eq!(hex::encode(identity.public_key_bytes()), *identity.id());
}

#[tokio::test]
async fn test_signature_verifies_against_node_id() {
    let dir = tempfile::tempdir().unwrap();
    let identity = NodeIdentity::load_or_generate(dir.path()).unwrap();
    let message = b"challenge nonce";
    let signature = identity.sign(message);
    verify_node_signature(identity.id(), message, &signature).unwrap();
}

#[tokio::test]
async fn test_signature_rejects_wrong_message() {
    let dir = tempfile::tempdir().unwrap();
    let identity = NodeIdentity::load_or_generate(dir.path()).unwrap();
    let signature = identity.sign(b"original");
    assert!(verify_node_signature(identity.id(), b"tampered", &signature).is_err());
}

#[tokio::test]
async fn test_signature_rejects_wrong_identity() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = NodeIdentity::load_or_generate(dir_a.path()).unwrap();
    let b = NodeIdentity::load_or_generate(dir_b.path()).unwrap();
    let signature = a.sign(b"message");
    assert!(verify_node_signature(b.id(), b"message", &signature).is_err());
}

#[tokio::test]
async fn test_corrupt_key_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("node.key"), b"short").unwrap();
    assert!(NodeIdentity::load_or_generate(dir.path()).is_err());
}
