// src/config.rs

//! Manages node configuration: loading, environment overrides, and validation.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

/// Network listeners and advertised addresses.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port for the client-facing HTTP surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Port for the framed peer-to-peer stream listener.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// UDP port for the gossip bus.
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,
    /// Address advertised to peers. Defaults to `host` when unset, which is
    /// only correct when `host` is a routable address.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            peer_port: default_peer_port(),
            gossip_port: default_gossip_port(),
            advertise_host: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    7460
}
fn default_peer_port() -> u16 {
    7461
}
fn default_gossip_port() -> u16 {
    7462
}

/// How peers are found when they are not already known.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryKind {
    /// Only the static bootstrap list is consulted.
    #[default]
    Static,
    /// Static list plus local UDP broadcast probing.
    Broadcast,
}

/// Cluster membership and peer discovery settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Shared string two nodes must agree on to mesh. Prevents accidental
    /// cross-cluster joins and keys the gossip HMAC.
    #[serde(default)]
    pub rendezvous: String,
    /// `host:peer_port` addresses tried during discovery cycles.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default)]
    pub discovery: DiscoveryKind,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    /// Maximum number of unknown peers dialed per discovery cycle.
    #[serde(default = "default_discovery_connect_cap")]
    pub discovery_connect_cap: usize,
    /// Node ids that are refused at the transport layer even when they know
    /// the rendezvous.
    #[serde(default)]
    pub deny_list: Vec<String>,
}

fn default_discovery_interval_ms() -> u64 {
    30_000
}
fn default_discovery_connect_cap() -> usize {
    8
}

/// Peer transport tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound on pooled sessions; least-recently-used idle sessions are
    /// evicted past this point.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_concurrent_dials")]
    pub max_concurrent_dials: usize,
    #[serde(default = "default_accept_workers")]
    pub accept_workers: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Bounded per-subscriber gossip queue; publishes fall back to
    /// synchronous delivery when full.
    #[serde(default = "default_gossip_event_buffer")]
    pub gossip_event_buffer: usize,
    #[serde(default = "default_gossip_max_payload")]
    pub gossip_max_payload: usize,
    /// Consecutive stream failures after which a session is torn down.
    #[serde(default = "default_session_failure_limit")]
    pub session_failure_limit: u32,
    /// Timeout for single request/response exchanges over `send`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_sessions: default_max_sessions(),
            max_concurrent_dials: default_max_concurrent_dials(),
            accept_workers: default_accept_workers(),
            max_frame_bytes: default_max_frame_bytes(),
            gossip_event_buffer: default_gossip_event_buffer(),
            gossip_max_payload: default_gossip_max_payload(),
            session_failure_limit: default_session_failure_limit(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_max_sessions() -> usize {
    100
}
fn default_max_concurrent_dials() -> usize {
    16
}
fn default_accept_workers() -> usize {
    16
}
fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_gossip_event_buffer() -> usize {
    50
}
fn default_gossip_max_payload() -> usize {
    4 * 1024
}
fn default_session_failure_limit() -> u32 {
    3
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Consensus log tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RaftConfig {
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_raft_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long a proposal waits for commit before failing.
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    /// Entries applied since the last snapshot before a new one is taken.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: u64,
    #[serde(default = "default_snapshot_chunk_bytes")]
    pub snapshot_chunk_bytes: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_raft_heartbeat_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
            snapshot_threshold: default_snapshot_threshold(),
            max_append_entries: default_max_append_entries(),
            snapshot_chunk_bytes: default_snapshot_chunk_bytes(),
        }
    }
}

fn default_election_timeout_min_ms() -> u64 {
    150
}
fn default_election_timeout_max_ms() -> u64 {
    300
}
fn default_raft_heartbeat_ms() -> u64 {
    20
}
fn default_commit_timeout_ms() -> u64 {
    5_000
}
fn default_snapshot_threshold() -> u64 {
    8_192
}
fn default_max_append_entries() -> u64 {
    64
}
fn default_snapshot_chunk_bytes() -> usize {
    512 * 1024
}

/// State store event fan-out tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StateConfig {
    /// Bounded per-subscriber event queue; overflowing subscribers are told
    /// to resync from a full snapshot.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

fn default_event_queue_capacity() -> usize {
    128
}

/// Request scheduler tuning. The four weights follow the scoring formula
/// `w1·(1−load) + w2·locality + w3·success − w4·queue_wait`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_w_load")]
    pub w_load: f64,
    #[serde(default = "default_w_locality")]
    pub w_locality: f64,
    #[serde(default = "default_w_success")]
    pub w_success: f64,
    #[serde(default = "default_w_queue")]
    pub w_queue: f64,
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
    #[serde(default = "default_breaker_window")]
    pub breaker_window: usize,
    #[serde(default = "default_breaker_min_calls")]
    pub breaker_min_calls: usize,
    #[serde(default = "default_breaker_failure_ratio")]
    pub breaker_failure_ratio: f64,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: f64,
    /// Concurrency cap assumed for nodes that have not declared one.
    #[serde(default = "default_concurrency_cap")]
    pub default_concurrency_cap: u32,
    /// Deadline applied to requests that do not carry one.
    #[serde(default = "default_request_deadline_ms")]
    pub default_deadline_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            w_load: default_w_load(),
            w_locality: default_w_locality(),
            w_success: default_w_success(),
            w_queue: default_w_queue(),
            retry_cap: default_retry_cap(),
            breaker_window: default_breaker_window(),
            breaker_min_calls: default_breaker_min_calls(),
            breaker_failure_ratio: default_breaker_failure_ratio(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            rate_limit_rps: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
            default_concurrency_cap: default_concurrency_cap(),
            default_deadline_ms: default_request_deadline_ms(),
        }
    }
}

fn default_w_load() -> f64 {
    0.4
}
fn default_w_locality() -> f64 {
    0.2
}
fn default_w_success() -> f64 {
    0.3
}
fn default_w_queue() -> f64 {
    0.1
}
fn default_retry_cap() -> u32 {
    2
}
fn default_breaker_window() -> usize {
    20
}
fn default_breaker_min_calls() -> usize {
    5
}
fn default_breaker_failure_ratio() -> f64 {
    0.5
}
fn default_breaker_cooldown_ms() -> u64 {
    30_000
}
fn default_rate_limit_rps() -> f64 {
    100.0
}
fn default_rate_limit_burst() -> f64 {
    200.0
}
fn default_concurrency_cap() -> u32 {
    8
}
fn default_request_deadline_ms() -> u64 {
    120_000
}

/// Which placement strategy the reconciler uses for a model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategyKind {
    Random,
    #[default]
    CapabilityAware,
    LocalityAware,
}

/// Model distribution and replication tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DistributionConfig {
    #[serde(default = "default_replication_min")]
    pub replication_min: u32,
    /// `0` means "up to cluster size".
    #[serde(default)]
    pub replication_max: u32,
    #[serde(default)]
    pub default_strategy: PlacementStrategyKind,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Concurrent chunks in flight per transfer.
    #[serde(default = "default_transfer_parallelism")]
    pub transfer_parallelism: usize,
    #[serde(default = "default_max_inbound_transfers")]
    pub max_inbound_transfers: usize,
    #[serde(default = "default_max_outbound_transfers")]
    pub max_outbound_transfers: usize,
    #[serde(default = "default_transfer_retry_cap")]
    pub retry_cap: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            replication_min: default_replication_min(),
            replication_max: 0,
            default_strategy: PlacementStrategyKind::default(),
            chunk_size: default_chunk_size(),
            transfer_parallelism: default_transfer_parallelism(),
            max_inbound_transfers: default_max_inbound_transfers(),
            max_outbound_transfers: default_max_outbound_transfers(),
            retry_cap: default_transfer_retry_cap(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

fn default_replication_min() -> u32 {
    2
}
fn default_chunk_size() -> usize {
    4 * 1024 * 1024
}
fn default_transfer_parallelism() -> usize {
    4
}
fn default_max_inbound_transfers() -> usize {
    8
}
fn default_max_outbound_transfers() -> usize {
    8
}
fn default_transfer_retry_cap() -> u32 {
    6
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    300_000
}
fn default_reconcile_interval_ms() -> u64 {
    30_000
}

/// Heartbeat and failure detection tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A peer unheard for `suspect_multiplier × heartbeat` is suspect.
    #[serde(default = "default_suspect_multiplier")]
    pub suspect_multiplier: u32,
    /// Continued silence for `down_multiplier × heartbeat` lets the leader
    /// propose the down transition without a second witness.
    #[serde(default = "default_down_multiplier")]
    pub down_multiplier: u32,
    #[serde(default = "default_rejoin_probe_timeout_ms")]
    pub rejoin_probe_timeout_ms: u64,
    /// How long a draining node keeps serving outstanding leases.
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            suspect_multiplier: default_suspect_multiplier(),
            down_multiplier: default_down_multiplier(),
            rejoin_probe_timeout_ms: default_rejoin_probe_timeout_ms(),
            drain_deadline_ms: default_drain_deadline_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_suspect_multiplier() -> u32 {
    3
}
fn default_down_multiplier() -> u32 {
    6
}
fn default_rejoin_probe_timeout_ms() -> u64 {
    5_000
}
fn default_drain_deadline_ms() -> u64 {
    60_000
}

/// The local inference engine this node wraps.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_engine_base_url")]
    pub base_url: String,
    /// Directory where the engine materializes model artifacts. The core
    /// treats its contents as opaque bytes.
    #[serde(default = "default_engine_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_engine_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_engine_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_engine_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
    #[serde(default = "default_engine_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_base_url(),
            models_dir: default_engine_models_dir(),
            request_timeout_ms: default_engine_request_timeout_ms(),
            health_timeout_ms: default_engine_health_timeout_ms(),
            readiness_poll_ms: default_engine_readiness_poll_ms(),
            readiness_timeout_ms: default_engine_readiness_timeout_ms(),
        }
    }
}

fn default_engine_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_engine_models_dir() -> String {
    "engine-models".to_string()
}
fn default_engine_request_timeout_ms() -> u64 {
    120_000
}
fn default_engine_health_timeout_ms() -> u64 {
    2_000
}
fn default_engine_readiness_poll_ms() -> u64 {
    1_000
}
fn default_engine_readiness_timeout_ms() -> u64 {
    120_000
}

/// TLS for the peer listener. When absent, peer streams are plain TCP but
/// still mutually authenticated by the handshake.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    7464
}

/// The fully typed node configuration. Every consumer reads typed fields;
/// nothing downstream re-parses raw values.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Declared failure zone used by locality-aware placement.
    #[serde(default)]
    pub zone: Option<String>,
    /// Bearer token required by the control API when set.
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_data_dir() -> String {
    "state".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize via defaults")
    }
}

impl Config {
    /// Loads the configuration from a TOML file, applies environment
    /// overrides, and validates the result.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies the fixed set of `INFERMESH_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("INFERMESH_HOST") {
            self.network.host = v;
        }
        if let Ok(v) = env::var("INFERMESH_HTTP_PORT") {
            if let Ok(port) = v.parse() {
                self.network.http_port = port;
            }
        }
        if let Ok(v) = env::var("INFERMESH_PEER_PORT") {
            if let Ok(port) = v.parse() {
                self.network.peer_port = port;
            }
        }
        if let Ok(v) = env::var("INFERMESH_BOOTSTRAP_PEERS") {
            self.cluster.bootstrap_peers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("INFERMESH_DATA_DIR") {
            self.data_dir = v;
        }
        if let Ok(v) = env::var("INFERMESH_RENDEZVOUS") {
            self.cluster.rendezvous = v;
        }
        if let Ok(v) = env::var("INFERMESH_REPLICATION_MIN") {
            if let Ok(n) = v.parse() {
                self.distribution.replication_min = n;
            }
        }
        if let Ok(v) = env::var("INFERMESH_REPLICATION_MAX") {
            if let Ok(n) = v.parse() {
                self.distribution.replication_max = n;
            }
        }
        if let Ok(v) = env::var("INFERMESH_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    /// Rejects configurations that cannot produce a working node.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.rendezvous.is_empty() {
            bail!("cluster.rendezvous must be set; nodes refuse to mesh without one");
        }
        if self.raft.election_timeout_min_ms >= self.raft.election_timeout_max_ms {
            bail!("raft.election_timeout_min_ms must be below raft.election_timeout_max_ms");
        }
        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_min_ms {
            bail!("raft.heartbeat_interval_ms must be well below the election timeout");
        }
        if self.distribution.replication_min == 0 {
            bail!("distribution.replication_min must be at least 1");
        }
        if self.distribution.replication_max != 0
            && self.distribution.replication_max < self.distribution.replication_min
        {
            bail!("distribution.replication_max must be >= replication_min (or 0 for unbounded)");
        }
        if self.distribution.chunk_size == 0 {
            bail!("distribution.chunk_size must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.scheduler.breaker_failure_ratio)
            || self.scheduler.breaker_failure_ratio == 0.0
        {
            bail!("scheduler.breaker_failure_ratio must be in (0, 1]");
        }
        if self.scheduler.breaker_min_calls > self.scheduler.breaker_window {
            bail!("scheduler.breaker_min_calls cannot exceed scheduler.breaker_window");
        }
        if self.scheduler.rate_limit_rps <= 0.0 || self.scheduler.rate_limit_burst <= 0.0 {
            bail!("scheduler rate limit parameters must be positive");
        }
        for (name, w) in [
            ("w_load", self.scheduler.w_load),
            ("w_locality", self.scheduler.w_locality),
            ("w_success", self.scheduler.w_success),
            ("w_queue", self.scheduler.w_queue),
        ] {
            if !(0.0..=1.0).contains(&w) {
                bail!("scheduler.{name} must be in [0, 1]");
            }
        }
        if self.transport.max_sessions == 0 {
            bail!("transport.max_sessions must be non-zero");
        }
        Ok(())
    }

    /// The address peers should dial for framed streams.
    pub fn advertised_peer_addr(&self) -> String {
        let host = self
            .network
            .advertise_host
            .as_deref()
            .unwrap_or(&self.network.host);
        format!("{host}:{}", self.network.peer_port)
    }

    /// The address peers should target with gossip datagrams.
    pub fn advertised_gossip_addr(&self) -> String {
        let host = self
            .network
            .advertise_host
            .as_deref()
            .unwrap_or(&self.network.host);
        format!("{host}:{}", self.network.gossip_port)
    }
}
