//! Configuration system tests
//!
//! Loading, validation, node selection and environment overrides

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use fedavg_node::config::NodeConfig;
use fedavg_node::error::Error;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("node.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn with_config(content: &str) -> Self {
        let fixture = Self::new();
        fs::write(&fixture.config_path, content).unwrap();
        fixture
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

const TWO_PEERS: &str = r#"
[node]
id = "alpha"

[[peers]]
id = "alpha"
addr = "127.0.0.1:9001"

[[peers]]
id = "beta"
addr = "127.0.0.1:9002"
"#;

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config_uses_defaults() {
    let fixture = ConfigFixture::with_config(TWO_PEERS);
    let config = NodeConfig::load(Some(fixture.path())).unwrap();

    assert_eq!(config.local_id().unwrap(), "alpha");
    assert_eq!(config.quorum(), 2);
    assert_eq!(config.federation.rounds, 5);
    assert_eq!(config.federation.topic, "federation");

    let bootstrap = config.bootstrap_config();
    assert_eq!(bootstrap.retry_interval, Duration::from_secs(2));
    assert!(bootstrap.timeout.is_none());
    assert!(config.coordinator_config().quorum_timeout.is_none());
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::with_config(
        r#"
[node]
id = "beta"

[federation]
topic = "mnist"
rounds = 12
quorum_timeout_secs = 30

[bootstrap]
retry_interval_ms = 500
timeout_secs = 60
connect_timeout_ms = 1000
handshake_timeout_ms = 750

[[peers]]
id = "alpha"
addr = "10.0.0.1:9001"

[[peers]]
id = "beta"
addr = "10.0.0.2:9001"

[trainer]
features = 4
train_samples = 64
test_samples = 16
learning_rate = 0.3
batch_size = 8
dataset_seed = 7

[logging]
level = "debug"
json_format = true
"#,
    );

    let config = NodeConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.local_index().unwrap(), 1);

    let coordinator = config.coordinator_config();
    assert_eq!(coordinator.topic, "mnist");
    assert_eq!(coordinator.rounds, 12);
    assert_eq!(coordinator.quorum_timeout, Some(Duration::from_secs(30)));

    let bootstrap = config.bootstrap_config();
    assert_eq!(bootstrap.retry_interval, Duration::from_millis(500));
    assert_eq!(bootstrap.timeout, Some(Duration::from_secs(60)));

    let mesh = config.mesh_config().unwrap();
    assert_eq!(mesh.listen_addr, "10.0.0.2:9001".parse().unwrap());
    assert_eq!(mesh.connection_timeout, Duration::from_millis(1000));
    assert_eq!(mesh.handshake_timeout, Duration::from_millis(750));

    assert_eq!(config.trainer.features, 4);
    assert_eq!(config.trainer.dataset_seed, 7);
    assert!(config.logging.json_format);
}

#[test]
fn test_generated_default_config_is_valid() {
    let fixture = ConfigFixture::with_config(&fedavg_node::config::generate_default_config());
    let config = NodeConfig::load(Some(fixture.path())).unwrap();

    assert_eq!(config.peers.len(), 3);
    assert_eq!(config.local_id().unwrap(), "node-1");
}

// ─────────────────────────────────────────────────────────────────
// Node Selection
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_select_node_by_id_and_index() {
    let fixture = ConfigFixture::with_config(TWO_PEERS);
    let mut config = NodeConfig::load(Some(fixture.path())).unwrap();

    config.select_node("beta").unwrap();
    assert_eq!(config.local_id().unwrap(), "beta");

    config.select_node("1").unwrap();
    assert_eq!(config.local_id().unwrap(), "alpha");
    assert_eq!(config.mesh_config().unwrap().listen_addr.port(), 9001);
}

#[test]
fn test_select_node_rejects_unknown() {
    let fixture = ConfigFixture::with_config(TWO_PEERS);
    let mut config = NodeConfig::load(Some(fixture.path())).unwrap();

    assert!(config.select_node("gamma").is_err());
    assert!(config.select_node("0").is_err());
    assert!(config.select_node("3").is_err());
    // Failed selections leave the identity alone
    assert_eq!(config.local_id().unwrap(), "alpha");
}

#[test]
fn test_load_for_node_selects_before_validating() {
    let shared = r#"
[[peers]]
id = "alpha"
addr = "127.0.0.1:9001"

[[peers]]
id = "beta"
addr = "127.0.0.1:9002"
"#;
    let fixture = ConfigFixture::with_config(shared);

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "node.id"));

    let config = NodeConfig::load_for_node(Some(fixture.path()), Some("beta")).unwrap();
    assert_eq!(config.local_id().unwrap(), "beta");
    assert_eq!(config.mesh_config().unwrap().listen_addr.port(), 9002);

    let config = NodeConfig::load_for_node(Some(fixture.path()), Some("1")).unwrap();
    assert_eq!(config.local_id().unwrap(), "alpha");

    assert!(NodeConfig::load_for_node(Some(fixture.path()), Some("gamma")).is_err());
}

#[test]
fn test_node_selector_overrides_node_section() {
    let fixture = ConfigFixture::with_config(TWO_PEERS);
    let config = NodeConfig::load_for_node(Some(fixture.path()), Some("beta")).unwrap();
    assert_eq!(config.local_id().unwrap(), "beta");
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

fn load_err(content: &str) -> Error {
    let fixture = ConfigFixture::with_config(content);
    NodeConfig::load(Some(fixture.path())).unwrap_err()
}

#[test]
fn test_duplicate_peer_id() {
    let err = load_err(
        r#"
[node]
id = "a"

[[peers]]
id = "a"
addr = "127.0.0.1:9001"

[[peers]]
id = "a"
addr = "127.0.0.1:9002"
"#,
    );
    assert!(matches!(err, Error::ConfigValidation { .. }));
    assert!(err.to_string().contains("duplicate peer id"));
}

#[test]
fn test_duplicate_peer_address() {
    let err = load_err(
        r#"
[node]
id = "a"

[[peers]]
id = "a"
addr = "127.0.0.1:9001"

[[peers]]
id = "b"
addr = "127.0.0.1:9001"
"#,
    );
    assert!(err.to_string().contains("duplicate peer address"));
}

#[test]
fn test_zero_rounds_rejected() {
    let err = load_err(&format!("{}\n[federation]\nrounds = 0\n", TWO_PEERS));
    assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "federation.rounds"));
}

#[test]
fn test_invalid_log_level() {
    let err = load_err(&format!("{}\n[logging]\nlevel = \"loud\"\n", TWO_PEERS));
    assert!(err.to_string().contains("Invalid log level"));
}

#[test]
fn test_invalid_peer_address() {
    let err = load_err(
        r#"
[[peers]]
id = "node-1"
addr = "not-an-address"
"#,
    );
    assert!(matches!(err, Error::ConfigParse { .. }));
}

#[test]
fn test_malformed_toml() {
    let err = load_err("[federation\nrounds = ");
    assert!(matches!(err, Error::ConfigParse { .. }));
}

#[test]
fn test_missing_file() {
    let err = NodeConfig::load(Some("/nonexistent/fedavg/node.toml")).unwrap_err();
    assert!(matches!(err, Error::ConfigNotFound { .. }));
}

// ─────────────────────────────────────────────────────────────────
// Environment Overrides (child process keeps env changes isolated)
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_federation_settings() {
    let fixture = ConfigFixture::with_config(TWO_PEERS);

    Command::cargo_bin("fedavg-node")
        .unwrap()
        .args(["config", "show", "--config", fixture.path()])
        .env("FEDAVG_ROUNDS", "9")
        .env("FEDAVG_TOPIC", "from-env")
        .env("FEDAVG_NODE_ID", "beta")
        .assert()
        .success()
        .stdout(predicate::str::contains("rounds = 9"))
        .stdout(predicate::str::contains("topic = \"from-env\""))
        .stdout(predicate::str::contains("id = \"beta\""));
}

#[test]
fn test_env_override_unknown_node_fails_validation() {
    let fixture = ConfigFixture::with_config(TWO_PEERS);

    Command::cargo_bin("fedavg-node")
        .unwrap()
        .args(["config", "validate", "--config", fixture.path()])
        .env("FEDAVG_NODE_ID", "gamma")
        .assert()
        .failure()
        .stderr(predicate::str::contains("gamma"));
}
