use infermesh::core::state::keys::{
    self, KeyRef, cfg_key, id_is_clean, model_key, node_key, parse_key, policy_key, replica_key,
};

#[tokio::test]
async fn test_node_key_round_trip() {
    let key = node_key(&"abc123".to_string());
    assert_eq!(parse_key(&key), Some(KeyRef::Node("abc123")));
}

#[tokio::test]
async fn test_model_key_round_trip() {
    let key = model_key(&"llama3:8b".to_string());
    assert_eq!(parse_key(&key), Some(KeyRef::Model("llama3:8b")));
}

#[tokio::test]
async fn test_replica_key_round_trip_with_awkward_model_id() {
    // Model ids may contain ':' and '/'; the separator keeps the composite
    // key unambiguous.
    let key = replica_key(&"registry/llama3:8b".to_string(), &"node-a".to_string());
    assert_eq!(
        parse_key(&key),
        Some(KeyRef::Replica {
            model: "registry/llama3:8b",
            node: "node-a"
        })
    );
}

#[tokio::test]
async fn test_policy_and_cfg_round_trip() {
    assert_eq!(
        parse_key(&policy_key(&"m1".to_string())),
        Some(KeyRef::Policy("m1"))
    );
    assert_eq!(parse_key(&cfg_key("log_level")), Some(KeyRef::Cfg("log_level")));
}

#[tokio::test]
async fn test_unknown_prefix_is_rejected() {
    assert_eq!(parse_key(b"bogus/abc"), None);
    assert_eq!(parse_key(b""), None);
}

#[tokio::test]
async fn test_separator_in_id_is_flagged() {
    assert!(id_is_clean("normal-id"));
    assert!(!id_is_clean("bad\u{1f}id"));
}

#[tokio::test]
async fn test_prefixes_are_distinct() {
    let prefixes = [
        keys::NODE_PREFIX,
        keys::MODEL_PREFIX,
        keys::REPLICA_PREFIX,
        keys::POLICY_PREFIX,
        keys::CFG_PREFIX,
    ];
    for (i, a) in prefixes.iter().enumerate() {
        for (j, b) in prefixes.iter().enumerate() {
            if i != j {
                assert!(!a.starts_with(b));
            }
        }
    }
}
