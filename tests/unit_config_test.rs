use infermesh::config::Config;

fn minimal_config() -> Config {
    let mut config = Config::default();
    config.cluster.rendezvous = "test-cluster".to_string();
    config
}

#[tokio::test]
async fn test_defaults_match_documented_values() {
    let config = minimal_config();
    assert_eq!(config.network.http_port, 7460);
    assert_eq!(config.transport.connect_timeout_ms, 5_000);
    assert_eq!(config.transport.max_sessions, 100);
    assert_eq!(config.transport.gossip_event_buffer, 50);
    assert_eq!(config.raft.election_timeout_min_ms, 150);
    assert_eq!(config.raft.election_timeout_max_ms, 300);
    assert_eq!(config.distribution.replication_min, 2);
    assert_eq!(config.distribution.transfer_parallelism, 4);
    assert_eq!(config.distribution.max_inbound_transfers, 8);
    assert_eq!(config.distribution.max_outbound_transfers, 8);
    assert_eq!(config.distribution.backoff_cap_ms, 300_000);
    assert_eq!(config.distribution.reconcile_interval_ms, 30_000);
    assert_eq!(config.scheduler.w_load, 0.4);
    assert_eq!(config.scheduler.w_locality, 0.2);
    assert_eq!(config.scheduler.w_success, 0.3);
    assert_eq!(config.scheduler.w_queue, 0.1);
    assert_eq!(config.scheduler.retry_cap, 2);
    assert_eq!(config.scheduler.breaker_window, 20);
    assert_eq!(config.scheduler.breaker_min_calls, 5);
    assert_eq!(config.scheduler.breaker_cooldown_ms, 30_000);
    assert_eq!(config.scheduler.rate_limit_rps, 100.0);
    assert_eq!(config.scheduler.rate_limit_burst, 200.0);
    assert_eq!(config.health.heartbeat_interval_ms, 5_000);
    assert_eq!(config.health.suspect_multiplier, 3);
    assert_eq!(config.health.down_multiplier, 6);
}

#[tokio::test]
async fn test_validation_requires_rendezvous() {
    let config = Config::default();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("rendezvous"));
}

#[tokio::test]
async fn test_validation_accepts_minimal_config() {
    minimal_config().validate().unwrap();
}

#[tokio::test]
async fn test_validation_rejects_inverted_election_window() {
    let mut config = minimal_config();
    config.raft.election_timeout_min_ms = 400;
    config.raft.election_timeout_max_ms = 300;
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_validation_rejects_replication_max_below_min() {
    let mut config = minimal_config();
    config.distribution.replication_min = 3;
    config.distribution.replication_max = 2;
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_validation_allows_unbounded_replication_max() {
    let mut config = minimal_config();
    config.distribution.replication_min = 3;
    config.distribution.replication_max = 0;
    config.validate().unwrap();
}

#[tokio::test]
async fn test_validation_rejects_bad_breaker_ratio() {
    let mut config = minimal_config();
    config.scheduler.breaker_failure_ratio = 0.0;
    assert!(config.validate().is_err());
    config.scheduler.breaker_failure_ratio = 1.5;
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_toml_sections_parse() {
    let raw = r#"
        data_dir = "/tmp/mesh"
        log_level = "debug"
        zone = "rack-1"

        [cluster]
        rendezvous = "prod-cluster"
        bootstrap_peers = ["10.0.0.1:7461", "10.0.0.2:7461"]
        discovery = "broadcast"

        [scheduler]
        rate_limit_rps = 50.0

        [distribution]
        replication_min = 3
        chunk_size = 1048576
    "#;
    let config: Config = toml::from_str(raw).unwrap();
    config.validate().unwrap();
    assert_eq!(config.data_dir, "/tmp/mesh");
    assert_eq!(config.zone.as_deref(), Some("rack-1"));
    assert_eq!(config.cluster.bootstrap_peers.len(), 2);
    assert_eq!(
        config.cluster.discovery,
        infermesh::config::DiscoveryKind::Broadcast
    );
    assert_eq!(config.scheduler.rate_limit_rps, 50.0);
    assert_eq!(config.distribution.replication_min, 3);
    assert_eq!(config.distribution.chunk_size, 1_048_576);
    // Unset sections still carry defaults.
    assert_eq!(config.scheduler.rate_limit_burst, 200.0);
}

#[tokio::test]
async fn test_advertised_addrs_prefer_advertise_host() {
    let mut config = minimal_config();
    config.network.host = "0.0.0.0".to_string();
    config.network.advertise_host = Some("10.1.2.3".to_string());
    assert_eq!(config.advertised_peer_addr(), "10.1.2.3:7461");
    assert_eq!(config.advertised_gossip_addr(), "10.1.2.3:7462");
}
