// src/core/health/mod.rs

//! Fault tolerance and health: heartbeats, failure detection, lifecycle
//! orchestration, and the directed probe protocol.

pub mod detector;
pub mod heartbeat;

pub use detector::{FailureDetector, SuspectReport, run_health_service};
pub use heartbeat::{Heartbeat, HeartbeatTask};

use crate::core::state::types::NodeCapabilities;
use sysinfo::System;

/// Directed probe/pong on the `health` stream protocol.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum HealthMsg {
    Probe,
    Pong {
        version: String,
        capabilities: NodeCapabilities,
    },
}

/// Gathers this host's capability declaration. GPU inventory and model
/// families come from configuration when the host cannot introspect them.
pub fn declare_capabilities() -> NodeCapabilities {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();
    NodeCapabilities {
        cpu_cores: sys.cpus().len() as u32,
        total_memory_bytes: sys.total_memory(),
        free_memory_bytes: sys.available_memory(),
        gpus: Vec::new(),
        families: Vec::new(),
    }
}
