use infermesh::core::scheduler::{BreakerConfig, BreakerMap};
use std::time::Duration;

fn map_with(cooldown: Duration) -> BreakerMap {
    BreakerMap::new(BreakerConfig {
        window: 20,
        min_calls: 5,
        failure_ratio: 0.5,
        cooldown,
    })
}

#[tokio::test]
async fn test_breaker_stays_closed_below_min_calls() {
    let map = map_with(Duration::from_secs(30));
    let breaker = map.get(&"n1".to_string(), &"m".to_string());
    for _ in 0..4 {
        breaker.record(false);
    }
    // Four failures, but fewer than five calls: still closed.
    assert!(breaker.allow());
    assert!(!breaker.is_open());
}

#[tokio::test]
async fn test_breaker_opens_past_failure_ratio() {
    let map = map_with(Duration::from_secs(30));
    let breaker = map.get(&"n1".to_string(), &"m".to_string());
    for _ in 0..3 {
        breaker.record(true);
    }
    for _ in 0..4 {
        breaker.record(false);
    }
    // 4 failures out of 7 calls is above 50%.
    assert!(breaker.is_open());
    assert!(!breaker.allow());
}

#[tokio::test]
async fn test_half_open_admits_exactly_one_probe() {
    let map = map_with(Duration::from_millis(0));
    let breaker = map.get(&"n1".to_string(), &"m".to_string());
    for _ in 0..6 {
        breaker.record(false);
    }
    // Cooldown is zero, so the first allow transitions to half-open.
    assert!(breaker.allow());
    assert!(!breaker.allow());
    assert!(!breaker.allow());
}

#[tokio::test]
async fn test_probe_success_closes_and_clears_window() {
    let map = map_with(Duration::from_millis(0));
    let breaker = map.get(&"n1".to_string(), &"m".to_string());
    for _ in 0..6 {
        breaker.record(false);
    }
    assert!(breaker.allow());
    breaker.record(true);
    assert!(!breaker.is_open());
    assert!(breaker.allow());
    assert_eq!(breaker.success_rate(), 1.0);
}

#[tokio::test]
async fn test_probe_failure_reopens() {
    let map = map_with(Duration::from_millis(0));
    let breaker = map.get(&"n1".to_string(), &"m".to_string());
    for _ in 0..6 {
        breaker.record(false);
    }
    assert!(breaker.allow());
    breaker.record(false);
    // Back to open; the next allow is the next half-open probe (cooldown 0).
    assert!(breaker.allow());
    assert!(!breaker.allow());
}

#[tokio::test]
async fn test_success_rate_reflects_window() {
    let map = map_with(Duration::from_secs(30));
    let breaker = map.get(&"n1".to_string(), &"m".to_string());
    assert_eq!(breaker.success_rate(), 1.0);
    breaker.record(true);
    breaker.record(false);
    assert_eq!(breaker.success_rate(), 0.5);
}

#[tokio::test]
async fn test_breakers_are_per_node_and_model() {
    let map = map_with(Duration::from_secs(30));
    let a = map.get(&"n1".to_string(), &"m1".to_string());
    for _ in 0..6 {
        a.record(false);
    }
    assert!(a.is_open());
    let b = map.get(&"n1".to_string(), &"m2".to_string());
    assert!(!b.is_open());
    let c = map.get(&"n2".to_string(), &"m1".to_string());
    assert!(!c.is_open());
    assert_eq!(map.open_count(), 1);
}
