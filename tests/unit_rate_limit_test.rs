use infermesh::core::scheduler::admission::RateLimiter;

#[tokio::test]
async fn test_burst_is_admitted_then_excess_rejected() {
    let limiter = RateLimiter::new(10.0, 5.0);
    for _ in 0..5 {
        assert!(limiter.try_acquire("alice"));
    }
    assert!(!limiter.try_acquire("alice"));
}

#[tokio::test]
async fn test_principals_have_independent_buckets() {
    let limiter = RateLimiter::new(10.0, 2.0);
    assert!(limiter.try_acquire("alice"));
    assert!(limiter.try_acquire("alice"));
    assert!(!limiter.try_acquire("alice"));
    // Bob's bucket is untouched.
    assert!(limiter.try_acquire("bob"));
}

#[tokio::test]
async fn test_tokens_refill_over_time() {
    let limiter = RateLimiter::new(1000.0, 2.0);
    assert!(limiter.try_acquire("alice"));
    assert!(limiter.try_acquire("alice"));
    assert!(!limiter.try_acquire("alice"));
    // At 1000 rps a few milliseconds is enough for one token.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(limiter.try_acquire("alice"));
}

#[tokio::test]
async fn test_refill_never_exceeds_burst() {
    let limiter = RateLimiter::new(1000.0, 3.0);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    for _ in 0..3 {
        assert!(limiter.try_acquire("alice"));
    }
    assert!(!limiter.try_acquire("alice"));
}
