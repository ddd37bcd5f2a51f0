// src/core/scheduler/mod.rs

//! The request scheduler: answers, for each inference request, which node
//! should serve it, or rejects it. Selection is deterministic given the
//! observable state; dispatch retries around retryable failures until the
//! response has started.

pub mod admission;
pub mod breaker;
pub mod lease;
pub mod proxy;
pub mod routes;

pub use breaker::{Breaker, BreakerConfig, BreakerMap};
pub use lease::{LeaseGuard, NodeLoad, NodeLoads};
pub use routes::RouteTable;

use crate::config::SchedulerConfig;
use crate::core::distribution::DistributionManager;
use crate::core::engine::EngineClient;
use crate::core::scheduler::admission::RateLimiter;
use crate::core::scheduler::proxy::{ProxyRequest, proxy_call};
use crate::core::state::types::NodeRecord;
use crate::core::transport::Transport;
use crate::core::{MeshError, ModelId, NodeId, now_ms};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Streamed response bytes, typed with the cluster error so a mid-stream
/// failure can be reported as a final error record instead of an abrupt
/// close.
pub type ServeBody = Pin<Box<dyn Stream<Item = Result<Bytes, MeshError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostClass {
    Cheap,
    #[default]
    Normal,
    Heavy,
}

/// Everything the scheduler needs to place one request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub model: ModelId,
    pub cost: CostClass,
    pub deadline: Option<Instant>,
    pub idempotency_key: Option<String>,
    pub principal: String,
    /// Operator override: force this target, bypassing scoring.
    pub forced_target: Option<NodeId>,
}

pub struct ServeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ServeBody,
    pub target: NodeId,
}

#[derive(Debug, Serialize)]
pub struct SchedulerStats {
    pub inflight: i64,
    pub open_breakers: usize,
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    node_id: NodeId,
    transport: Arc<Transport>,
    engine: Arc<EngineClient>,
    distribution: Arc<DistributionManager>,
    pub routes: Arc<RouteTable>,
    pub loads: Arc<NodeLoads>,
    breakers: BreakerMap,
    limiter: RateLimiter,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SchedulerConfig,
        node_id: NodeId,
        transport: Arc<Transport>,
        engine: Arc<EngineClient>,
        distribution: Arc<DistributionManager>,
        routes: Arc<RouteTable>,
        loads: Arc<NodeLoads>,
    ) -> Arc<Self> {
        let breakers = BreakerMap::new(BreakerConfig {
            window: cfg.breaker_window,
            min_calls: cfg.breaker_min_calls,
            failure_ratio: cfg.breaker_failure_ratio,
            cooldown: Duration::from_millis(cfg.breaker_cooldown_ms),
        });
        let limiter = RateLimiter::new(cfg.rate_limit_rps, cfg.rate_limit_burst);
        Arc::new(Self {
            cfg,
            node_id,
            transport,
            engine,
            distribution,
            routes,
            loads,
            breakers,
            limiter,
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            inflight: crate::core::metrics::LEASES_INFLIGHT.get(),
            open_breakers: self.breakers.open_count(),
        }
    }

    /// `score = w1·(1−load) + w2·locality + w3·success − w4·queue_wait`,
    /// all inputs normalized to [0, 1].
    fn score(&self, candidate: &NodeRecord, model: &ModelId) -> f64 {
        let node_load = self.loads.get(&candidate.id);
        let load = node_load.normalized_load();
        let locality = if candidate.id == self.node_id { 1.0 } else { 0.0 };
        let success = self.breakers.get(&candidate.id, model).success_rate();
        let queue_wait = (node_load.queue_wait_ms.load(std::sync::atomic::Ordering::Relaxed)
            as f64
            / 10_000.0)
            .clamp(0.0, 1.0);
        self.cfg.w_load * (1.0 - load)
            + self.cfg.w_locality * locality
            + self.cfg.w_success * success
            - self.cfg.w_queue * queue_wait
    }

    /// Steps 1–5 of the placement algorithm: lookup, admission, scoring,
    /// selection, lease.
    pub fn select(
        &self,
        model: &ModelId,
        forced: Option<&NodeId>,
        exclude: &HashSet<NodeId>,
    ) -> Result<(NodeRecord, LeaseGuard), MeshError> {
        let candidates = self.routes.candidates(model);
        if candidates.is_empty() {
            return Err(MeshError::NoReplicas(model.clone()));
        }

        if let Some(forced) = forced {
            let Some(candidate) = candidates.iter().find(|c| c.id == *forced) else {
                return Err(MeshError::NoReplicas(model.clone()));
            };
            let lease = LeaseGuard::acquire(self.loads.get(forced), forced.clone());
            return Ok((candidate.clone(), lease));
        }

        let admitted: Vec<&NodeRecord> = candidates
            .iter()
            .filter(|c| !exclude.contains(&c.id))
            .filter(|c| {
                let load = self.loads.get(&c.id);
                let cap = if c.concurrency_cap > 0 {
                    c.concurrency_cap
                } else {
                    self.cfg.default_concurrency_cap
                };
                load.effective_inflight() < cap
            })
            .filter(|c| self.breakers.get(&c.id, model).allow())
            .collect();
        if admitted.is_empty() {
            return Err(MeshError::Overloaded);
        }

        let mut scored: Vec<(&NodeRecord, f64)> = admitted
            .into_iter()
            .map(|c| (c, self.score(c, model)))
            .collect();
        scored.sort_by(|(a, score_a), (b, score_b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| {
                    self.loads
                        .get(&a.id)
                        .effective_inflight()
                        .cmp(&self.loads.get(&b.id).effective_inflight())
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let target = scored[0].0.clone();
        let lease = LeaseGuard::acquire(self.loads.get(&target.id), target.id.clone());
        Ok((target, lease))
    }

    /// Best-effort replication trigger when a model has no replicas; the
    /// caller decides whether the client waits.
    pub fn trigger_ensure_local(&self, model: &ModelId) {
        let distribution = self.distribution.clone();
        let model = model.clone();
        tokio::spawn(async move {
            if let Err(e) = distribution.ensure_local(&model).await {
                debug!("Best-effort EnsureLocal for {model}: {e}");
            }
        });
    }

    /// Dispatches an inference request, retrying on the next-best candidate
    /// for retryable failures, up to the cap and within the deadline. Once
    /// a response has started streaming there are no further retries.
    pub async fn dispatch(
        self: &Arc<Self>,
        req: &RequestDescriptor,
        path: &str,
        body: Bytes,
    ) -> Result<ServeResponse, MeshError> {
        if !self.limiter.try_acquire(&req.principal) {
            crate::core::metrics::RATE_LIMITED_TOTAL.inc();
            crate::core::metrics::REQUESTS_TOTAL
                .with_label_values(&["rate-limited"])
                .inc();
            return Err(MeshError::RateLimited);
        }

        let deadline = req
            .deadline
            .unwrap_or_else(|| Instant::now() + Duration::from_millis(self.cfg.default_deadline_ms));

        let mut exclude: HashSet<NodeId> = HashSet::new();
        let mut attempt: u32 = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                crate::core::metrics::REQUESTS_TOTAL
                    .with_label_values(&["deadline"])
                    .inc();
                return Err(MeshError::DeadlineExceeded);
            }
            let remaining = deadline - now;

            let (target, lease) =
                match self.select(&req.model, req.forced_target.as_ref(), &exclude) {
                    Ok(pair) => pair,
                    Err(MeshError::NoReplicas(model)) => {
                        self.trigger_ensure_local(&model);
                        crate::core::metrics::REQUESTS_TOTAL
                            .with_label_values(&["no-replicas"])
                            .inc();
                        return Err(MeshError::NoReplicas(model));
                    }
                    Err(e) => {
                        crate::core::metrics::REQUESTS_TOTAL
                            .with_label_values(&["rejected"])
                            .inc();
                        return Err(e);
                    }
                };
            let breaker = self.breakers.get(&target.id, &req.model);

            let call = self.call_target(&target.id, path, body.clone(), deadline);
            match tokio::time::timeout(remaining, call).await {
                Ok(Ok(response)) => {
                    crate::core::metrics::REQUESTS_TOTAL
                        .with_label_values(&["dispatched"])
                        .inc();
                    return Ok(Self::wrap_response(response, lease, breaker, target.id));
                }
                Ok(Err(e)) => {
                    breaker.record(false);
                    drop(lease);
                    let can_retry = e.is_retryable()
                        && req.forced_target.is_none()
                        && attempt < self.cfg.retry_cap;
                    if can_retry {
                        debug!("Dispatch to {} failed ({e}); retrying next-best", target.id);
                        exclude.insert(target.id);
                        attempt += 1;
                        continue;
                    }
                    crate::core::metrics::REQUESTS_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    return Err(e);
                }
                Err(_) => {
                    breaker.record(false);
                    drop(lease);
                    crate::core::metrics::REQUESTS_TOTAL
                        .with_label_values(&["deadline"])
                        .inc();
                    return Err(MeshError::DeadlineExceeded);
                }
            }
        }
    }

    async fn call_target(
        &self,
        target: &NodeId,
        path: &str,
        body: Bytes,
        deadline: Instant,
    ) -> Result<ServeResponse, MeshError> {
        if *target == self.node_id {
            let response = self.engine.infer(path, body).await?;
            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body: ServeBody = Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| MeshError::from(e))),
            );
            return Ok(ServeResponse {
                status,
                headers,
                body,
                target: target.clone(),
            });
        }

        let deadline_ms = now_ms() + deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
        let proxied = proxy_call(
            &self.transport,
            target,
            ProxyRequest {
                method: "POST".to_string(),
                path: path.to_string(),
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: body.to_vec(),
                deadline_ms,
            },
        )
        .await?;
        Ok(ServeResponse {
            status: proxied.status,
            headers: proxied.headers,
            body: proxied.body,
            target: target.clone(),
        })
    }

    /// Ties the lease and breaker outcome to the response stream: the lease
    /// releases and the breaker records exactly once, when the stream ends,
    /// fails, or is dropped by the client.
    fn wrap_response(
        response: ServeResponse,
        lease: LeaseGuard,
        breaker: Arc<Breaker>,
        target: NodeId,
    ) -> ServeResponse {
        let started = lease.acquired_at;
        let mut inner = response.body;
        let body: ServeBody = Box::pin(async_stream::stream! {
            let mut lease = lease;
            loop {
                match inner.next().await {
                    Some(Ok(bytes)) => yield Ok(bytes),
                    Some(Err(e)) => {
                        warn!("Response stream from {target} failed: {e}");
                        breaker.record(false);
                        lease.release();
                        yield Err(e);
                        return;
                    }
                    None => {
                        breaker.record(true);
                        lease.release();
                        crate::core::metrics::REQUEST_LATENCY_SECONDS
                            .observe(started.elapsed().as_secs_f64());
                        return;
                    }
                }
            }
        });
        ServeResponse {
            status: response.status,
            headers: response.headers,
            body,
            target: response.target,
        }
    }
}
