// src/core/scheduler/breaker.rs

//! Sliding-window circuit breakers, one per (target node, model). A breaker
//! opens when more than the configured share of recent calls failed, cools
//! down, lets one probe through half-open, and closes again on success.

use crate::core::{ModelId, NodeId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: usize,
    pub min_calls: usize,
    pub failure_ratio: f64,
    pub cooldown: Duration,
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_out: bool },
}

#[derive(Debug)]
struct Inner {
    outcomes: VecDeque<bool>,
    state: BreakerState,
}

pub struct Breaker {
    cfg: BreakerConfig,
    inner: parking_lot::Mutex<Inner>,
}

impl Breaker {
    fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: parking_lot::Mutex::new(Inner {
                outcomes: VecDeque::new(),
                state: BreakerState::Closed,
            }),
        }
    }

    /// Whether a call may be sent to this target now. In half-open state
    /// exactly one probe is admitted.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match &mut inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    inner.state = BreakerState::HalfOpen { probe_out: true };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { probe_out } => {
                if *probe_out {
                    false
                } else {
                    *probe_out = true;
                    true
                }
            }
        }
    }

    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        inner.outcomes.push_back(success);
        while inner.outcomes.len() > self.cfg.window {
            inner.outcomes.pop_front();
        }
        match inner.state {
            BreakerState::HalfOpen { .. } => {
                if success {
                    inner.outcomes.clear();
                    inner.state = BreakerState::Closed;
                    crate::core::metrics::BREAKERS_OPEN.dec();
                } else {
                    inner.state = BreakerState::Open {
                        until: Instant::now() + self.cfg.cooldown,
                    };
                }
            }
            BreakerState::Closed => {
                let calls = inner.outcomes.len();
                if calls >= self.cfg.min_calls {
                    let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
                    if failures as f64 / calls as f64 > self.cfg.failure_ratio {
                        inner.state = BreakerState::Open {
                            until: Instant::now() + self.cfg.cooldown,
                        };
                        crate::core::metrics::BREAKERS_OPEN.inc();
                    }
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Share of recent calls that succeeded, 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.outcomes.is_empty() {
            return 1.0;
        }
        let ok = inner.outcomes.iter().filter(|ok| **ok).count();
        ok as f64 / inner.outcomes.len() as f64
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, BreakerState::Open { .. })
    }
}

/// Breaker registry keyed by (node, model).
pub struct BreakerMap {
    cfg: BreakerConfig,
    map: DashMap<(NodeId, ModelId), Arc<Breaker>>,
}

impl BreakerMap {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            map: DashMap::new(),
        }
    }

    pub fn get(&self, node: &NodeId, model: &ModelId) -> Arc<Breaker> {
        self.map
            .entry((node.clone(), model.clone()))
            .or_insert_with(|| Arc::new(Breaker::new(self.cfg.clone())))
            .clone()
    }

    pub fn open_count(&self) -> usize {
        self.map.iter().filter(|e| e.value().is_open()).count()
    }
}
