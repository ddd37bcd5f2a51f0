// src/core/scheduler/admission.rs

//! Per-principal token buckets. Admission is global across the worker
//! pool: the bucket is checked before any scheduling work happens.

use dashmap::DashMap;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    rps: f64,
    burst: f64,
    buckets: DashMap<String, parking_lot::Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(rps: f64, burst: f64) -> Self {
        Self {
            rps,
            burst,
            buckets: DashMap::new(),
        }
    }

    /// Takes one token for the principal, refilling lazily. Returns false
    /// when the bucket is empty; the caller fails the request immediately
    /// with `rate-limited`.
    pub fn try_acquire(&self, principal: &str) -> bool {
        let entry = self
            .buckets
            .entry(principal.to_string())
            .or_insert_with(|| {
                parking_lot::Mutex::new(Bucket {
                    tokens: self.burst,
                    last_refill: Instant::now(),
                })
            });
        let mut bucket = entry.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
