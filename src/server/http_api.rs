// src/server/http_api.rs

//! The client-facing HTTP surface, compatible with the single-engine API:
//! inference calls are scheduled across the cluster, model-control calls
//! are mediated through the distribution manager so placement stays
//! consistent.

use super::context::SharedState;
use crate::core::scheduler::{CostClass, RequestDescriptor};
use crate::core::state::types::ReplicaStatus;
use crate::core::{MeshError, ModelId};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Optional request headers understood by the cluster facade.
pub const HEADER_PRINCIPAL: &str = "x-infermesh-principal";
pub const HEADER_TARGET: &str = "x-infermesh-target";
pub const HEADER_DEADLINE_MS: &str = "x-infermesh-deadline-ms";
/// When set, a request for a model with no ready replicas waits for the
/// triggered replication instead of failing immediately.
pub const HEADER_WAIT: &str = "x-infermesh-wait";

const WAIT_POLL: Duration = Duration::from_millis(500);
const WAIT_DEFAULT: Duration = Duration::from_secs(60);

pub fn router() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/chat", post(chat))
        .route("/api/embed", post(embed))
        .route("/api/embeddings", post(embed))
        .route("/api/tags", get(tags))
        .route("/api/pull", post(pull))
        .route("/api/push", post(push))
        .route("/api/delete", delete(delete_model))
        .route("/api/show", post(show))
        .route("/api/copy", post(copy_model))
}

/// Maps a cluster error onto the upstream error shape, with an added
/// machine-readable reason code.
pub fn error_response(e: &MeshError) -> Response {
    let status = match e {
        MeshError::NoReplicas(_) | MeshError::NotFound(_) => StatusCode::NOT_FOUND,
        MeshError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        MeshError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        MeshError::DeadlineExceeded | MeshError::EngineTimeout => StatusCode::GATEWAY_TIMEOUT,
        MeshError::NotLeader(_) | MeshError::CommitTimeout | MeshError::EngineUnhealthy => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MeshError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        MeshError::AuthFailed(_) => StatusCode::FORBIDDEN,
        MeshError::InvariantViolation(_) => StatusCode::CONFLICT,
        MeshError::Draining => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error": e.to_string(),
            "code": e.code(),
            "reason": e.reason(),
        })),
    )
        .into_response()
}

fn principal_of(headers: &HeaderMap) -> String {
    headers
        .get(HEADER_PRINCIPAL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

fn descriptor_from(headers: &HeaderMap, model: ModelId) -> RequestDescriptor {
    let deadline = headers
        .get(HEADER_DEADLINE_MS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let forced_target = headers
        .get(HEADER_TARGET)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    RequestDescriptor {
        model,
        cost: CostClass::Normal,
        deadline,
        idempotency_key: headers
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
        principal: principal_of(headers),
        forced_target,
    }
}

fn model_from_body(body: &[u8]) -> Result<ModelId, MeshError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| MeshError::InvalidRequest(format!("malformed JSON body: {e}")))?;
    value
        .get("model")
        .or_else(|| value.get("name"))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
        .ok_or_else(|| MeshError::InvalidRequest("missing 'model' field".to_string()))
}

/// A mid-stream failure becomes a final error record instead of an abrupt
/// close, preserving the upstream streaming contract.
fn body_with_error_record(
    body: crate::core::scheduler::ServeBody,
) -> impl futures::Stream<Item = Result<Bytes, MeshError>> {
    body.map(|item| match item {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            let record = json!({
                "error": e.to_string(),
                "code": e.code(),
                "reason": e.reason(),
            });
            Ok(Bytes::from(format!("{record}\n")))
        }
    })
}

async fn dispatch_inference(
    shared: Arc<SharedState>,
    headers: HeaderMap,
    path: &str,
    body: Bytes,
) -> Response {
    let model = match model_from_body(&body) {
        Ok(model) => model,
        Err(e) => return error_response(&e),
    };
    let descriptor = descriptor_from(&headers, model);

    let mut result = shared.scheduler.dispatch(&descriptor, path, body.clone()).await;
    let waiting_for = match &result {
        Err(MeshError::NoReplicas(missing)) if headers.contains_key(HEADER_WAIT) => {
            Some(missing.clone())
        }
        _ => None,
    };
    if let Some(missing) = waiting_for {
        // The scheduler already triggered a best-effort EnsureLocal; the
        // client opted into waiting for it.
        let deadline = descriptor
            .deadline
            .unwrap_or_else(|| Instant::now() + WAIT_DEFAULT);
        while Instant::now() < deadline {
            tokio::time::sleep(WAIT_POLL).await;
            if !shared.scheduler.routes.candidates(&missing).is_empty() {
                result = shared.scheduler.dispatch(&descriptor, path, body).await;
                break;
            }
        }
    }

    match result {
        Ok(serve) => {
            let mut response = Response::builder().status(
                StatusCode::from_u16(serve.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            );
            // Content-length is dropped: an appended error record may
            // change the length.
            for (name, value) in &serve.headers {
                if name.eq_ignore_ascii_case("content-type") {
                    response = response.header(name.as_str(), value.as_str());
                }
            }
            response = response.header("x-infermesh-served-by", serve.target.as_str());
            response
                .body(Body::from_stream(body_with_error_record(serve.body)))
                .unwrap_or_else(|e| {
                    error_response(&MeshError::Internal(format!("response build: {e}")))
                })
        }
        Err(e) => error_response(&e),
    }
}

async fn generate(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(shared, headers, "/api/generate", body).await
}

async fn chat(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(shared, headers, "/api/chat", body).await
}

async fn embed(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(shared, headers, "/api/embed", body).await
}

/// Cluster-wide model list in the upstream tags shape.
async fn tags(State(shared): State<Arc<SharedState>>) -> Response {
    let models: Vec<serde_json::Value> = shared
        .store
        .models()
        .into_iter()
        .map(|m| {
            let replicas = shared
                .store
                .replicas_of(&m.id)
                .into_iter()
                .filter(|r| r.status == ReplicaStatus::Ready)
                .count();
            json!({
                "name": m.id,
                "model": m.id,
                "size": m.size,
                "digest": m.root_digest,
                "details": {
                    "family": m.family,
                },
                "replicas": replicas,
            })
        })
        .collect();
    Json(json!({ "models": models })).into_response()
}

/// Pulls a model through the local engine, then publishes it to the
/// cluster. Progress from the engine is relayed as it streams; the final
/// record reports cluster publication.
async fn pull(State(shared): State<Arc<SharedState>>, body: Bytes) -> Response {
    let model = match model_from_body(&body) {
        Ok(model) => model,
        Err(e) => return error_response(&e),
    };
    let family = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("family").and_then(|f| f.as_str()).map(String::from))
        .unwrap_or_default();

    let stream = async_stream::stream! {
        match shared.engine.pull(&model).await {
            Ok(resp) => {
                let mut upstream = resp.bytes_stream();
                while let Some(chunk) = upstream.next().await {
                    match chunk {
                        Ok(bytes) => yield Ok::<Bytes, MeshError>(bytes),
                        Err(e) => {
                            let e = MeshError::from(e);
                            yield Ok(Bytes::from(format!(
                                "{}\n",
                                json!({"error": e.to_string(), "code": e.code()})
                            )));
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                yield Ok(Bytes::from(format!(
                    "{}\n",
                    json!({"error": e.to_string(), "code": e.code()})
                )));
                return;
            }
        }

        // The engine has the artifact; publish it cluster-wide so the
        // reconciler can replicate it to the policy minimum.
        yield Ok(Bytes::from(format!(
            "{}\n",
            json!({"status": "publishing to cluster"})
        )));
        match shared.distribution.publish_from_engine(&model, &family).await {
            Ok(record) => {
                debug!("Published {model} ({} bytes)", record.size);
                yield Ok(Bytes::from(format!("{}\n", json!({"status": "success"}))));
            }
            Err(e) => {
                yield Ok(Bytes::from(format!(
                    "{}\n",
                    json!({"error": e.to_string(), "code": e.code(), "reason": e.reason()})
                )));
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| error_response(&MeshError::Internal(format!("response build: {e}"))))
}

/// Pushes are relayed to a node holding a ready replica.
async fn push(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(shared, headers, "/api/push", body).await
}

async fn delete_model(State(shared): State<Arc<SharedState>>, body: Bytes) -> Response {
    let model = match model_from_body(&body) {
        Ok(model) => model,
        Err(e) => return error_response(&e),
    };
    match shared.distribution.delete_model(&model).await {
        Ok(()) => Json(json!({"status": "success"})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn show(State(shared): State<Arc<SharedState>>, body: Bytes) -> Response {
    let model = match model_from_body(&body) {
        Ok(model) => model,
        Err(e) => return error_response(&e),
    };
    let Some(record) = shared.store.model(&model) else {
        return error_response(&MeshError::NotFound(format!("model {model}")));
    };
    let placements: Vec<serde_json::Value> = shared
        .store
        .replicas_of(&model)
        .into_iter()
        .map(|r| json!({"node": r.node, "status": r.status.to_string()}))
        .collect();
    Json(json!({
        "modelfile": "",
        "parameters": "",
        "template": "",
        "details": {
            "family": record.family,
        },
        "size": record.size,
        "digest": record.root_digest,
        "chunks": record.chunks.len(),
        "placements": placements,
    }))
    .into_response()
}

/// Copies a model descriptor under a new name. Chunks are shared in the
/// content store, so replication of the copy deduplicates against the
/// source wherever both are held.
async fn copy_model(State(shared): State<Arc<SharedState>>, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(&MeshError::InvalidRequest(format!("malformed JSON: {e}")));
        }
    };
    let (Some(source), Some(destination)) = (
        value.get("source").and_then(|v| v.as_str()),
        value.get("destination").and_then(|v| v.as_str()),
    ) else {
        return error_response(&MeshError::InvalidRequest(
            "copy requires 'source' and 'destination'".to_string(),
        ));
    };

    let Some(record) = shared.store.model(&source.to_string()) else {
        return error_response(&MeshError::NotFound(format!("model {source}")));
    };
    let (name, version) = match destination.rsplit_once(':') {
        Some((name, version)) => (name.to_string(), version.to_string()),
        None => (destination.to_string(), "latest".to_string()),
    };
    let copy = crate::core::state::types::ModelRecord {
        id: destination.to_string(),
        name,
        version,
        ..record.clone()
    };

    let put_model = crate::core::raft::LogRecord::Put {
        key: crate::core::state::keys::model_key(&copy.id),
        value: match crate::core::transport::framing::to_wire(&copy) {
            Ok(v) => v,
            Err(e) => return error_response(&e),
        },
    };
    if let Err(e) = shared.proposer.propose(put_model).await {
        return error_response(&e);
    }
    if let Some(mut policy) = shared.store.policy(&record.id) {
        policy.model = copy.id.clone();
        let put_policy = crate::core::raft::LogRecord::Put {
            key: crate::core::state::keys::policy_key(&copy.id),
            value: match crate::core::transport::framing::to_wire(&policy) {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            },
        };
        if let Err(e) = shared.proposer.propose(put_policy).await {
            return error_response(&e);
        }
    }
    Json(json!({"status": "success"})).into_response()
}
