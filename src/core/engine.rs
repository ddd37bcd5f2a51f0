// src/core/engine.rs

//! Client for the local inference engine: a black-box HTTP service on
//! localhost. The core never parses the engine's model files; it feeds
//! artifacts into the engine's model directory and watches readiness.

use crate::config::EngineConfig;
use crate::core::MeshError;
use bytes::Bytes;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct EngineClient {
    http: reqwest::Client,
    base: String,
    health_timeout: Duration,
    readiness_poll: Duration,
    readiness_timeout: Duration,
}

impl EngineClient {
    pub fn new(cfg: &EngineConfig) -> Result<Self, MeshError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| MeshError::Internal(format!("engine http client: {e}")))?;
        Ok(Self {
            http,
            base: cfg.base_url.trim_end_matches('/').to_string(),
            health_timeout: Duration::from_millis(cfg.health_timeout_ms),
            readiness_poll: Duration::from_millis(cfg.readiness_poll_ms),
            readiness_timeout: Duration::from_millis(cfg.readiness_timeout_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base);
        match self
            .http
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Starts an engine-side model load. The response streams progress
    /// lines that callers may relay to the client.
    pub async fn pull(&self, name: &str) -> Result<reqwest::Response, MeshError> {
        let url = format!("{}/api/pull", self.base);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "name": name }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(MeshError::EngineRejected(format!(
                "pull returned {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    /// Relays an inference call (`/api/generate`, `/api/chat`, `/api/embed`)
    /// and returns the streaming response untouched.
    pub async fn infer(&self, path: &str, body: Bytes) -> Result<reqwest::Response, MeshError> {
        let url = format!("{}{path}", self.base);
        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await?;
        if resp.status().is_client_error() {
            return Err(MeshError::EngineRejected(format!(
                "{path} returned {}",
                resp.status()
            )));
        }
        if resp.status().is_server_error() {
            return Err(MeshError::EngineUnhealthy);
        }
        Ok(resp)
    }

    /// The engine's list of loaded models.
    pub async fn tags(&self) -> Result<serde_json::Value, MeshError> {
        let url = format!("{}/api/tags", self.base);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(MeshError::EngineUnhealthy);
        }
        Ok(resp.json().await?)
    }

    pub async fn has_model(&self, name: &str) -> Result<bool, MeshError> {
        let tags = self.tags().await?;
        let found = tags
            .get("models")
            .and_then(|m| m.as_array())
            .is_some_and(|models| {
                models.iter().any(|m| {
                    m.get("name").and_then(|n| n.as_str()) == Some(name)
                        || m.get("model").and_then(|n| n.as_str()) == Some(name)
                })
            });
        Ok(found)
    }

    pub async fn delete(&self, name: &str) -> Result<(), MeshError> {
        let url = format!("{}/api/delete", self.base);
        let resp = self
            .http
            .delete(&url)
            .json(&json!({ "name": name }))
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(MeshError::EngineRejected(format!(
                "delete returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Polls the engine until the model shows up in its tags, or times out.
    pub async fn wait_ready(&self, name: &str) -> Result<(), MeshError> {
        let deadline = tokio::time::Instant::now() + self.readiness_timeout;
        loop {
            match self.has_model(name).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("Engine does not list {name} yet"),
                Err(e) => debug!("Engine readiness poll failed: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MeshError::EngineTimeout);
            }
            tokio::time::sleep(self.readiness_poll).await;
        }
    }
}
