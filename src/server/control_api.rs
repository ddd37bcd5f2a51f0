// src/server/control_api.rs

//! Control-plane endpoints, separate from the upstream-compatible surface:
//! cluster introspection and admin actions. All JSON; guarded by the
//! configured admin token when one is set.

use super::context::SharedState;
use super::http_api::error_response;
use crate::core::raft::LogRecord;
use crate::core::state::keys;
use crate::core::state::types::{NodeLifecycle, PlacementStrategy, ReplicationPolicy};
use crate::core::transport::framing::to_wire;
use crate::core::{MeshError, now_ms};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub fn router() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/cluster/status", get(status))
        .route("/cluster/nodes", get(nodes))
        .route("/cluster/models", get(models))
        .route("/cluster/transfers", get(transfers))
        .route("/cluster/scheduler", get(scheduler_stats))
        .route("/cluster/drain/{node}", post(drain))
        .route("/cluster/undrain/{node}", post(undrain))
        .route("/cluster/policy/{model}", put(set_policy))
        .route("/cluster/loglevel", put(set_log_level))
        .route("/cluster/snapshot", post(snapshot))
}

fn check_admin(shared: &SharedState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &shared.config.admin_token else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_response(&MeshError::AuthFailed(
            "missing or invalid admin token".to_string(),
        )))
    }
}

async fn status(State(shared): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    let raft = shared.raft.status();
    Json(json!({
        "node": shared.node_id(),
        "version": env!("CARGO_PKG_VERSION"),
        "role": raft.role.to_string(),
        "term": raft.term,
        "leader": raft.leader,
        "commit_index": raft.commit_index,
        "applied_index": shared.store.applied_index(),
        "voters": raft.membership.voters,
        "nodes": shared.store.nodes().len(),
        "live_nodes": shared.store.live_nodes().len(),
        "models": shared.store.models().len(),
    }))
    .into_response()
}

async fn nodes(State(shared): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    let nodes: Vec<serde_json::Value> = shared
        .store
        .nodes()
        .into_iter()
        .map(|n| {
            let load = shared.loads.get(&n.id);
            json!({
                "id": n.id,
                "state": n.state.to_string(),
                "addrs": n.addrs,
                "zone": n.zone,
                "version": n.version,
                "last_heartbeat_ms": n.last_heartbeat_ms,
                "inflight": load.effective_inflight(),
                "load": load.normalized_load(),
                "capabilities": {
                    "cpu_cores": n.capabilities.cpu_cores,
                    "total_memory_bytes": n.capabilities.total_memory_bytes,
                    "free_memory_bytes": n.capabilities.free_memory_bytes,
                    "gpus": n.capabilities.gpus.len(),
                    "families": n.capabilities.families,
                },
            })
        })
        .collect();
    Json(json!({ "nodes": nodes })).into_response()
}

async fn models(State(shared): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    let models: Vec<serde_json::Value> = shared
        .store
        .models()
        .into_iter()
        .map(|m| {
            let replicas: Vec<serde_json::Value> = shared
                .store
                .replicas_of(&m.id)
                .into_iter()
                .map(|r| {
                    json!({
                        "node": r.node,
                        "status": r.status.to_string(),
                        "bytes_transferred": r.bytes_transferred,
                        "last_verified_ms": r.last_verified_ms,
                        "error": r.error,
                    })
                })
                .collect();
            let policy = shared.store.policy(&m.id);
            json!({
                "id": m.id,
                "size": m.size,
                "digest": m.root_digest,
                "chunks": m.chunks.len(),
                "policy": policy.map(|p| json!({
                    "min": p.min,
                    "max": p.max,
                    "strategy": format!("{:?}", p.strategy),
                })),
                "replicas": replicas,
            })
        })
        .collect();
    Json(json!({ "models": models })).into_response()
}

async fn transfers(State(shared): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    let transfers: Vec<serde_json::Value> = shared
        .distribution
        .active_transfers
        .iter()
        .map(|entry| {
            let progress = entry.value();
            json!({
                "model": progress.model,
                "source": progress.source,
                "total_bytes": progress.total_bytes,
                "bytes": progress.bytes.load(Ordering::Relaxed),
                "started_ms": progress.started_ms,
            })
        })
        .collect();
    Json(json!({ "transfers": transfers })).into_response()
}

async fn scheduler_stats(State(shared): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    Json(shared.scheduler.stats()).into_response()
}

async fn transition_node(
    shared: &SharedState,
    node: &str,
    state: NodeLifecycle,
) -> Result<(), MeshError> {
    let Some(mut record) = shared.store.node(&node.to_string()) else {
        return Err(MeshError::NotFound(format!("node {node}")));
    };
    record.state = state;
    record.last_heartbeat_ms = now_ms();
    shared
        .proposer
        .propose(LogRecord::Put {
            key: keys::node_key(&record.id),
            value: to_wire(&record)?,
        })
        .await?;
    Ok(())
}

/// Graceful drain: the node stops taking new leases and new transfer
/// sourcing but finishes what it holds.
async fn drain(
    State(shared): State<Arc<SharedState>>,
    Path(node): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    match transition_node(&shared, &node, NodeLifecycle::Draining).await {
        Ok(()) => Json(json!({"status": "draining"})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn undrain(
    State(shared): State<Arc<SharedState>>,
    Path(node): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    match transition_node(&shared, &node, NodeLifecycle::Live).await {
        Ok(()) => Json(json!({"status": "live"})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct PolicyBody {
    min: u32,
    #[serde(default)]
    max: u32,
    #[serde(default)]
    strategy: Option<String>,
}

async fn set_policy(
    State(shared): State<Arc<SharedState>>,
    Path(model): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PolicyBody>,
) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    let strategy = match body.strategy.as_deref() {
        Some("random") => PlacementStrategy::Random,
        Some("capability-aware") | None => PlacementStrategy::CapabilityAware,
        Some("locality-aware") => PlacementStrategy::LocalityAware,
        Some(other) => {
            return error_response(&MeshError::InvalidRequest(format!(
                "unknown placement strategy '{other}'"
            )));
        }
    };
    let policy = ReplicationPolicy {
        model: model.clone(),
        min: body.min,
        max: body.max,
        strategy,
    };
    let value = match to_wire(&policy) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };
    match shared
        .proposer
        .propose(LogRecord::Put {
            key: keys::policy_key(&model),
            value,
        })
        .await
    {
        Ok(_) => Json(json!({"status": "success"})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct LogLevelBody {
    level: String,
}

/// Sets the log level cluster-wide through the replicated `cfg/` namespace;
/// every node applies it via its reload handle.
async fn set_log_level(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(body): Json<LogLevelBody>,
) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    if tracing_subscriber::filter::EnvFilter::try_new(&body.level).is_err() {
        return error_response(&MeshError::InvalidRequest(format!(
            "invalid log level '{}'",
            body.level
        )));
    }
    match shared
        .proposer
        .propose(LogRecord::Put {
            key: keys::cfg_key("log_level"),
            value: body.level.into_bytes(),
        })
        .await
    {
        Ok(_) => Json(json!({"status": "success"})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn snapshot(State(shared): State<Arc<SharedState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin(&shared, &headers) {
        return resp;
    }
    match shared.raft.trigger_snapshot().await {
        Ok(index) => Json(json!({"status": "success", "applied_index": index})).into_response(),
        Err(e) => error_response(&e),
    }
}
