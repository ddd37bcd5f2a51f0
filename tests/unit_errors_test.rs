use infermesh::MeshError;

#[tokio::test]
async fn test_wire_codes_are_stable_and_distinct() {
    let errors = vec![
        MeshError::Unreachable("x".into()),
        MeshError::Timeout("x".into()),
        MeshError::AuthFailed("x".into()),
        MeshError::StreamClosed,
        MeshError::NotLeader(None),
        MeshError::CommitTimeout,
        MeshError::Aborted,
        MeshError::InvariantViolation("x".into()),
        MeshError::NotFound("x".into()),
        MeshError::StaleRead,
        MeshError::NoReplicas("m".into()),
        MeshError::Overloaded,
        MeshError::RateLimited,
        MeshError::DeadlineExceeded,
        MeshError::IntegrityFailed {
            model: "m".into(),
            detail: "d".into(),
        },
        MeshError::SourceUnavailable("m".into()),
        MeshError::StorageFull,
        MeshError::EngineUnhealthy,
        MeshError::EngineRejected("x".into()),
        MeshError::EngineTimeout,
        MeshError::Draining,
        MeshError::Fatal("x".into()),
    ];
    let mut codes: Vec<u16> = errors.iter().map(|e| e.code()).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len(), "wire codes must be distinct");
}

#[tokio::test]
async fn test_from_code_preserves_the_kind() {
    let originals = vec![
        MeshError::StreamClosed,
        MeshError::CommitTimeout,
        MeshError::Overloaded,
        MeshError::RateLimited,
        MeshError::DeadlineExceeded,
        MeshError::StorageFull,
        MeshError::EngineTimeout,
        MeshError::Draining,
    ];
    for original in originals {
        let decoded = MeshError::from_code(original.code(), "detail");
        assert_eq!(decoded.code(), original.code());
    }
}

#[tokio::test]
async fn test_retryability_classification() {
    // Retryable at higher layers.
    assert!(MeshError::Unreachable("x".into()).is_retryable());
    assert!(MeshError::Timeout("x".into()).is_retryable());
    assert!(MeshError::StreamClosed.is_retryable());
    assert!(MeshError::NotLeader(None).is_retryable());
    assert!(MeshError::Overloaded.is_retryable());

    // Never retried transparently.
    assert!(!MeshError::AuthFailed("x".into()).is_retryable());
    assert!(!MeshError::InvariantViolation("x".into()).is_retryable());
    assert!(
        !MeshError::IntegrityFailed {
            model: "m".into(),
            detail: "d".into()
        }
        .is_retryable()
    );
    assert!(!MeshError::RateLimited.is_retryable());
    assert!(!MeshError::DeadlineExceeded.is_retryable());
}

#[tokio::test]
async fn test_reason_tags_are_namespaced() {
    assert_eq!(MeshError::StreamClosed.reason(), "transport/stream-closed");
    assert_eq!(
        MeshError::NoReplicas("m".into()).reason(),
        "scheduling/no-replicas"
    );
    assert_eq!(
        MeshError::IntegrityFailed {
            model: "m".into(),
            detail: String::new()
        }
        .reason(),
        "distribution/integrity-failed"
    );
}

#[tokio::test]
async fn test_clone_and_eq() {
    let e = MeshError::NotLeader(Some("n1".to_string()));
    assert_eq!(e.clone(), e);
    let io = MeshError::from(std::io::Error::other("disk"));
    assert_eq!(io.clone(), io);
}
