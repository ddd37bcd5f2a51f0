// src/core/errors.rs

//! Defines the primary error type for the entire application.

use crate::core::NodeId;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the node.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum MeshError {
    // --- Transport ---
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Stream closed by peer")]
    StreamClosed,

    // --- Consensus ---
    #[error("Not the leader{}", leader_hint(.0))]
    NotLeader(Option<NodeId>),

    #[error("Proposal timed out waiting for commit")]
    CommitTimeout,

    #[error("Proposal aborted")]
    Aborted,

    // --- State ---
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stale read")]
    StaleRead,

    // --- Scheduling ---
    #[error("No ready replicas for model '{0}'")]
    NoReplicas(String),

    #[error("All candidate nodes are overloaded")]
    Overloaded,

    #[error("Rate limited")]
    RateLimited,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    // --- Distribution ---
    #[error("Integrity check failed for '{model}': {detail}")]
    IntegrityFailed { model: String, detail: String },

    #[error("No available source for model '{0}'")]
    SourceUnavailable(String),

    #[error("Local storage full")]
    StorageFull,

    // --- Engine ---
    #[error("Local engine is unhealthy")]
    EngineUnhealthy,

    #[error("Engine rejected the request: {0}")]
    EngineRejected(String),

    #[error("Engine call timed out")]
    EngineTimeout,

    // --- Node lifecycle ---
    #[error("Node is draining and refuses new work")]
    Draining,

    // --- Fatal & plumbing ---
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn leader_hint(leader: &Option<NodeId>) -> String {
    match leader {
        Some(id) => format!(" (leader is {id})"),
        None => String::new(),
    }
}

/// Stable numeric codes carried across the network boundary. The vocabulary
/// is small and versioned with the stream protocols; strings never cross the
/// wire as error identities.
impl MeshError {
    pub fn code(&self) -> u16 {
        match self {
            MeshError::Unreachable(_) => 10,
            MeshError::Timeout(_) => 11,
            MeshError::AuthFailed(_) => 12,
            MeshError::StreamClosed => 13,
            MeshError::NotLeader(_) => 20,
            MeshError::CommitTimeout => 21,
            MeshError::Aborted => 22,
            MeshError::InvariantViolation(_) => 30,
            MeshError::NotFound(_) => 31,
            MeshError::StaleRead => 32,
            MeshError::NoReplicas(_) => 40,
            MeshError::Overloaded => 41,
            MeshError::RateLimited => 42,
            MeshError::DeadlineExceeded => 43,
            MeshError::IntegrityFailed { .. } => 50,
            MeshError::SourceUnavailable(_) => 51,
            MeshError::StorageFull => 52,
            MeshError::EngineUnhealthy => 60,
            MeshError::EngineRejected(_) => 61,
            MeshError::EngineTimeout => 62,
            MeshError::Draining => 70,
            MeshError::Fatal(_) => 90,
            MeshError::Io(_) => 91,
            MeshError::Codec(_) => 92,
            MeshError::HttpClient(_) => 93,
            MeshError::InvalidRequest(_) => 94,
            MeshError::Internal(_) => 95,
        }
    }

    /// Reconstructs a typed error from a wire code, for errors received from
    /// a peer. Detail strings are advisory only.
    pub fn from_code(code: u16, detail: &str) -> Self {
        match code {
            10 => MeshError::Unreachable(detail.to_string()),
            11 => MeshError::Timeout(detail.to_string()),
            12 => MeshError::AuthFailed(detail.to_string()),
            13 => MeshError::StreamClosed,
            20 => MeshError::NotLeader(None),
            21 => MeshError::CommitTimeout,
            22 => MeshError::Aborted,
            30 => MeshError::InvariantViolation(detail.to_string()),
            31 => MeshError::NotFound(detail.to_string()),
            32 => MeshError::StaleRead,
            40 => MeshError::NoReplicas(detail.to_string()),
            41 => MeshError::Overloaded,
            42 => MeshError::RateLimited,
            43 => MeshError::DeadlineExceeded,
            50 => MeshError::IntegrityFailed {
                model: detail.to_string(),
                detail: String::new(),
            },
            51 => MeshError::SourceUnavailable(detail.to_string()),
            52 => MeshError::StorageFull,
            60 => MeshError::EngineUnhealthy,
            61 => MeshError::EngineRejected(detail.to_string()),
            62 => MeshError::EngineTimeout,
            70 => MeshError::Draining,
            90 => MeshError::Fatal(detail.to_string()),
            94 => MeshError::InvalidRequest(detail.to_string()),
            _ => MeshError::Internal(detail.to_string()),
        }
    }

    /// Whether a higher layer may transparently retry the failed operation.
    /// Non-retryable errors surface to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Unreachable(_)
                | MeshError::Timeout(_)
                | MeshError::StreamClosed
                | MeshError::NotLeader(_)
                | MeshError::CommitTimeout
                | MeshError::Overloaded
                | MeshError::SourceUnavailable(_)
                | MeshError::EngineUnhealthy
                | MeshError::Draining
                | MeshError::Io(_)
        )
    }

    /// Short machine-readable reason tag exposed in HTTP error bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            MeshError::Unreachable(_) => "transport/unreachable",
            MeshError::Timeout(_) => "transport/timeout",
            MeshError::AuthFailed(_) => "transport/auth-failed",
            MeshError::StreamClosed => "transport/stream-closed",
            MeshError::NotLeader(_) => "consensus/not-leader",
            MeshError::CommitTimeout => "consensus/commit-timeout",
            MeshError::Aborted => "consensus/aborted",
            MeshError::InvariantViolation(_) => "state/invariant-violation",
            MeshError::NotFound(_) => "state/not-found",
            MeshError::StaleRead => "state/stale-read",
            MeshError::NoReplicas(_) => "scheduling/no-replicas",
            MeshError::Overloaded => "scheduling/overloaded",
            MeshError::RateLimited => "scheduling/rate-limited",
            MeshError::DeadlineExceeded => "scheduling/deadline-exceeded",
            MeshError::IntegrityFailed { .. } => "distribution/integrity-failed",
            MeshError::SourceUnavailable(_) => "distribution/source-unavailable",
            MeshError::StorageFull => "distribution/storage-full",
            MeshError::EngineUnhealthy => "engine/unhealthy",
            MeshError::EngineRejected(_) => "engine/rejected",
            MeshError::EngineTimeout => "engine/timeout",
            MeshError::Draining => "node/draining",
            MeshError::Fatal(_) => "fatal",
            MeshError::Io(_) => "io",
            MeshError::Codec(_) => "codec",
            MeshError::HttpClient(_) => "http-client",
            MeshError::InvalidRequest(_) => "invalid-request",
            MeshError::Internal(_) => "internal",
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for MeshError {
    fn clone(&self) -> Self {
        match self {
            MeshError::Unreachable(s) => MeshError::Unreachable(s.clone()),
            MeshError::Timeout(s) => MeshError::Timeout(s.clone()),
            MeshError::AuthFailed(s) => MeshError::AuthFailed(s.clone()),
            MeshError::StreamClosed => MeshError::StreamClosed,
            MeshError::NotLeader(l) => MeshError::NotLeader(l.clone()),
            MeshError::CommitTimeout => MeshError::CommitTimeout,
            MeshError::Aborted => MeshError::Aborted,
            MeshError::InvariantViolation(s) => MeshError::InvariantViolation(s.clone()),
            MeshError::NotFound(s) => MeshError::NotFound(s.clone()),
            MeshError::StaleRead => MeshError::StaleRead,
            MeshError::NoReplicas(s) => MeshError::NoReplicas(s.clone()),
            MeshError::Overloaded => MeshError::Overloaded,
            MeshError::RateLimited => MeshError::RateLimited,
            MeshError::DeadlineExceeded => MeshError::DeadlineExceeded,
            MeshError::IntegrityFailed { model, detail } => MeshError::IntegrityFailed {
                model: model.clone(),
                detail: detail.clone(),
            },
            MeshError::SourceUnavailable(s) => MeshError::SourceUnavailable(s.clone()),
            MeshError::StorageFull => MeshError::StorageFull,
            MeshError::EngineUnhealthy => MeshError::EngineUnhealthy,
            MeshError::EngineRejected(s) => MeshError::EngineRejected(s.clone()),
            MeshError::EngineTimeout => MeshError::EngineTimeout,
            MeshError::Draining => MeshError::Draining,
            MeshError::Fatal(s) => MeshError::Fatal(s.clone()),
            MeshError::Io(e) => MeshError::Io(Arc::clone(e)),
            MeshError::Codec(s) => MeshError::Codec(s.clone()),
            MeshError::HttpClient(s) => MeshError::HttpClient(s.clone()),
            MeshError::InvalidRequest(s) => MeshError::InvalidRequest(s.clone()),
            MeshError::Internal(s) => MeshError::Internal(s.clone()),
        }
    }
}

impl PartialEq for MeshError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MeshError::Io(e1), MeshError::Io(e2)) => e1.to_string() == e2.to_string(),
            (MeshError::NotLeader(a), MeshError::NotLeader(b)) => a == b,
            (
                MeshError::IntegrityFailed {
                    model: m1,
                    detail: d1,
                },
                MeshError::IntegrityFailed {
                    model: m2,
                    detail: d2,
                },
            ) => m1 == m2 && d1 == d2,
            (MeshError::Unreachable(a), MeshError::Unreachable(b))
            | (MeshError::Timeout(a), MeshError::Timeout(b))
            | (MeshError::AuthFailed(a), MeshError::AuthFailed(b))
            | (MeshError::InvariantViolation(a), MeshError::InvariantViolation(b))
            | (MeshError::NotFound(a), MeshError::NotFound(b))
            | (MeshError::NoReplicas(a), MeshError::NoReplicas(b))
            | (MeshError::SourceUnavailable(a), MeshError::SourceUnavailable(b))
            | (MeshError::EngineRejected(a), MeshError::EngineRejected(b))
            | (MeshError::Fatal(a), MeshError::Fatal(b))
            | (MeshError::Codec(a), MeshError::Codec(b))
            | (MeshError::HttpClient(a), MeshError::HttpClient(b))
            | (MeshError::InvalidRequest(a), MeshError::InvalidRequest(b))
            | (MeshError::Internal(a), MeshError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for MeshError {
    fn from(e: std::io::Error) -> Self {
        MeshError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            MeshError::EngineTimeout
        } else if e.is_connect() {
            MeshError::EngineUnhealthy
        } else {
            MeshError::HttpClient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Codec(format!("JSON: {e}"))
    }
}

impl From<bincode::error::EncodeError> for MeshError {
    fn from(e: bincode::error::EncodeError) -> Self {
        MeshError::Codec(format!("encode: {e}"))
    }
}

impl From<bincode::error::DecodeError> for MeshError {
    fn from(e: bincode::error::DecodeError) -> Self {
        MeshError::Codec(format!("decode: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for MeshError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MeshError::Timeout("operation deadline elapsed".to_string())
    }
}
