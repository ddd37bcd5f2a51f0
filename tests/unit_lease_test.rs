use infermesh::core::scheduler::{LeaseGuard, NodeLoads};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_acquire_increments_and_release_decrements() {
    let loads = NodeLoads::new();
    let load = loads.get(&"n1".to_string());
    assert_eq!(load.inflight.load(Ordering::SeqCst), 0);

    let mut lease = LeaseGuard::acquire(load.clone(), "n1".to_string());
    assert_eq!(load.inflight.load(Ordering::SeqCst), 1);
    lease.release();
    assert_eq!(load.inflight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let loads = NodeLoads::new();
    let load = loads.get(&"n1".to_string());
    let mut lease = LeaseGuard::acquire(load.clone(), "n1".to_string());
    lease.release();
    lease.release();
    drop(lease);
    // Exactly one decrement: the count never goes negative.
    assert_eq!(load.inflight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_drop_releases_exactly_once() {
    let loads = NodeLoads::new();
    let load = loads.get(&"n1".to_string());
    {
        let _lease = LeaseGuard::acquire(load.clone(), "n1".to_string());
        assert_eq!(load.inflight.load(Ordering::SeqCst), 1);
    }
    assert_eq!(load.inflight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_leases_balance() {
    let loads = NodeLoads::new();
    let load = loads.get(&"n1".to_string());
    let leases: Vec<LeaseGuard> = (0..16)
        .map(|_| LeaseGuard::acquire(load.clone(), "n1".to_string()))
        .collect();
    assert_eq!(load.inflight.load(Ordering::SeqCst), 16);
    drop(leases);
    assert_eq!(load.inflight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_effective_inflight_uses_reported_maximum() {
    let loads = NodeLoads::new();
    let load = loads.get(&"n1".to_string());
    let _lease = LeaseGuard::acquire(load.clone(), "n1".to_string());
    load.reported_inflight.store(5, Ordering::Relaxed);
    assert_eq!(load.effective_inflight(), 5);
    load.reported_inflight.store(0, Ordering::Relaxed);
    assert_eq!(load.effective_inflight(), 1);
}

#[tokio::test]
async fn test_normalized_load_combines_signals() {
    let loads = NodeLoads::new();
    let load = loads.get(&"n1".to_string());
    load.cap.store(10, Ordering::Relaxed);
    load.reported_inflight.store(5, Ordering::Relaxed);
    assert_eq!(load.normalized_load(), 0.5);
    load.load_permille.store(900, Ordering::Relaxed);
    assert_eq!(load.normalized_load(), 0.9);
}
