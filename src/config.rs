//! Configuration system for the federation node
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments (`--node`)
//! 2. Environment variables (FEDAVG_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values
//!
//! Every node of a federation should share the same `[[peers]]` list and
//! `[federation]` section; only the selected identity differs.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::federation::{CoordinatorConfig, DEFAULT_ROUNDS, DEFAULT_TOPIC};
use crate::peer::{BootstrapConfig, PeerEntry};
use crate::trainer::LogisticConfig;
use crate::transport::MeshConfig;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Which configured identity this process is
    ///
    /// A file without `[node]` selects nobody; the process then needs `--node`.
    #[serde(default)]
    pub node: NodeSettings,

    /// Round loop settings
    pub federation: FederationSettings,

    /// Peer dialing at startup
    pub bootstrap: BootstrapSettings,

    /// Full membership, this node included
    pub peers: Vec<PeerSettings>,

    /// Built-in trainer and synthetic dataset
    pub trainer: LogisticConfig,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Peer id from `[[peers]]` (overridden by `--node`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Round loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationSettings {
    /// Gossip topic shared by all nodes
    pub topic: String,

    /// Number of communication rounds
    pub rounds: u64,

    /// Give up on a round after this many seconds (0 = wait forever)
    pub quorum_timeout_secs: u64,
}

/// Bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Pause between dialing passes in milliseconds
    pub retry_interval_ms: u64,

    /// Give up bootstrapping after this many seconds (0 = wait forever)
    pub timeout_secs: u64,

    /// TCP connect timeout per dial in milliseconds
    pub connect_timeout_ms: u64,

    /// HELLO / HELLO_ACK timeout in milliseconds
    pub handshake_timeout_ms: u64,
}

/// One `[[peers]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSettings {
    pub id: String,
    pub addr: SocketAddr,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                id: Some("node-1".to_string()),
            },
            federation: FederationSettings::default(),
            bootstrap: BootstrapSettings::default(),
            peers: default_peers(),
            trainer: LogisticConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            rounds: DEFAULT_ROUNDS,
            quorum_timeout_secs: 0, // Wait forever
        }
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 2000,
            timeout_secs: 0, // Wait forever
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

fn default_peers() -> Vec<PeerSettings> {
    (1..=3u16)
        .map(|i| PeerSettings {
            id: format!("node-{}", i),
            addr: SocketAddr::from(([127, 0, 0, 1], 7400 + i)),
        })
        .collect()
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_for_node(config_path, None)
    }

    /// Load configuration, selecting the local identity before validation
    ///
    /// `node` (an id or 1-based index) wins over both `[node]` and
    /// `FEDAVG_NODE_ID`.
    pub fn load_for_node(config_path: Option<&str>, node: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = Self::from_toml(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Command-line identity
        if let Some(selector) = node {
            config.select_node(selector)?;
        }

        // 5. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document (no env overrides, no validation)
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.message().to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            Some(PathBuf::from("fedavg-node.toml")),
            Some(PathBuf::from("config.toml")),
            // User config directory
            dirs::config_dir().map(|p| p.join("fedavg-node").join("node.toml")),
            // Home directory
            dirs::home_dir().map(|p| p.join(".fedavg-node").join("node.toml")),
        ];

        for path in search_paths.iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Node identity
        if let Ok(val) = std::env::var("FEDAVG_NODE_ID") {
            self.node.id = Some(val);
        }

        // Federation settings
        if let Ok(val) = std::env::var("FEDAVG_TOPIC") {
            self.federation.topic = val;
        }
        if let Ok(val) = std::env::var("FEDAVG_ROUNDS") {
            if let Ok(n) = val.parse() {
                self.federation.rounds = n;
            }
        }
        if let Ok(val) = std::env::var("FEDAVG_QUORUM_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                self.federation.quorum_timeout_secs = n;
            }
        }

        // Bootstrap settings
        if let Ok(val) = std::env::var("FEDAVG_RETRY_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.bootstrap.retry_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("FEDAVG_BOOTSTRAP_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                self.bootstrap.timeout_secs = n;
            }
        }

        // Trainer settings
        if let Ok(val) = std::env::var("FEDAVG_DATASET_SEED") {
            if let Ok(n) = val.parse() {
                self.trainer.dataset_seed = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("FEDAVG_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("FEDAVG_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("FEDAVG_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(Error::config_field_invalid("peers", "at least one [[peers]] entry is required"));
        }

        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        for peer in &self.peers {
            if peer.id.trim().is_empty() {
                return Err(Error::config_field_invalid("peers.id", "peer id cannot be empty"));
            }
            if !ids.insert(peer.id.as_str()) {
                return Err(Error::config_field_invalid(
                    "peers.id",
                    format!("duplicate peer id '{}'", peer.id),
                ));
            }
            if !addrs.insert(peer.addr) {
                return Err(Error::config_field_invalid(
                    "peers.addr",
                    format!("duplicate peer address {}", peer.addr),
                ));
            }
        }

        if self.federation.topic.trim().is_empty() {
            return Err(Error::config_field_invalid("federation.topic", "topic cannot be empty"));
        }
        if self.federation.rounds == 0 {
            return Err(Error::config_field_invalid("federation.rounds", "must be at least 1"));
        }
        if self.bootstrap.retry_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "bootstrap.retry_interval_ms",
                "must be greater than 0",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        self.trainer.validate()?;

        match self.node.id.as_deref() {
            None => Err(Error::config_field_invalid(
                "node.id",
                "no node identity selected (set [node] id or pass --node)",
            )),
            Some(id) if !ids.contains(id) => Err(Error::config_field_invalid(
                "node.id",
                format!("'{}' is not one of the configured peers", id),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Choose the local identity by peer id or 1-based position in `[[peers]]`
    pub fn select_node(&mut self, selector: &str) -> Result<()> {
        if let Some(peer) = self.peers.iter().find(|p| p.id == selector) {
            self.node.id = Some(peer.id.clone());
            return Ok(());
        }

        let index: usize = selector.parse().map_err(|_| {
            Error::config_field_invalid("node", format!("unknown node '{}'", selector))
        })?;
        let peer = index
            .checked_sub(1)
            .and_then(|i| self.peers.get(i))
            .ok_or_else(|| {
                Error::config_field_invalid(
                    "node",
                    format!("node index {} out of range 1..={}", index, self.peers.len()),
                )
            })?;
        self.node.id = Some(peer.id.clone());
        Ok(())
    }

    /// Selected identity; only `None` before validation
    pub fn local_id(&self) -> Result<&str> {
        self.node
            .id
            .as_deref()
            .ok_or_else(|| Error::config_field_invalid("node.id", "no node identity selected"))
    }

    /// Position of the local node in `[[peers]]`, used as its data partition
    pub fn local_index(&self) -> Result<usize> {
        let id = self.local_id()?;
        self.peers
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::config_field_invalid("node.id", format!("'{}' is not a configured peer", id)))
    }

    /// Contributions per round: every configured peer
    pub fn quorum(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_entries(&self) -> Vec<PeerEntry> {
        self.peers.iter().map(|p| PeerEntry::new(p.id.clone(), p.addr)).collect()
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            topic: self.federation.topic.clone(),
            rounds: self.federation.rounds,
            quorum_timeout: non_zero_secs(self.federation.quorum_timeout_secs),
        }
    }

    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            retry_interval: Duration::from_millis(self.bootstrap.retry_interval_ms),
            timeout: non_zero_secs(self.bootstrap.timeout_secs),
        }
    }

    /// Mesh settings listening on the local peer's configured address
    pub fn mesh_config(&self) -> Result<MeshConfig> {
        let index = self.local_index()?;
        Ok(MeshConfig {
            listen_addr: self.peers[index].addr,
            connection_timeout: Duration::from_millis(self.bootstrap.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.bootstrap.handshake_timeout_ms),
            ..MeshConfig::default()
        })
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fedavg-node")
                .join("node.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# Federated averaging node configuration
#
# Every node in a federation uses the same [[peers]] list and
# [federation] section. Select this node with [node] id or --node.

[node]
# Which [[peers]] entry this process is (id or use --node <id|index>)
id = "node-1"

[federation]
# Gossip topic shared by all nodes
topic = "federation"

# Number of communication rounds
rounds = 5

# Give up on a round after this many seconds (0 = wait forever)
quorum_timeout_secs = 0

[bootstrap]
# Pause between dialing passes in milliseconds
retry_interval_ms = 2000

# Give up bootstrapping after this many seconds (0 = wait forever)
timeout_secs = 0

# TCP connect timeout per dial in milliseconds
connect_timeout_ms = 5000

# HELLO / HELLO_ACK timeout in milliseconds
handshake_timeout_ms = 5000

# Full membership, this node included. Quorum is the number of entries.
[[peers]]
id = "node-1"
addr = "127.0.0.1:7401"

[[peers]]
id = "node-2"
addr = "127.0.0.1:7402"

[[peers]]
id = "node-3"
addr = "127.0.0.1:7403"

[trainer]
# Input features of the synthetic task
features = 8

# Samples in this node's training and evaluation partitions
train_samples = 512
test_samples = 128

# Mini-batch SGD settings
learning_rate = 0.1
batch_size = 10

# Must match on every node
dataset_seed = 42

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.fedavg-node/logs/node.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.federation.topic, "federation");
        assert_eq!(config.federation.rounds, 5);
        assert_eq!(config.bootstrap.retry_interval_ms, 2000);
        assert_eq!(config.quorum(), 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_generated_config_matches_defaults() {
        let parsed = NodeConfig::from_toml(&generate_default_config()).unwrap();
        let defaults = NodeConfig::default();

        assert_eq!(parsed.peers, defaults.peers);
        assert_eq!(parsed.trainer, defaults.trainer);
        assert_eq!(parsed.federation.rounds, defaults.federation.rounds);
        assert_eq!(parsed.bootstrap.retry_interval_ms, defaults.bootstrap.retry_interval_ms);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        env::set_var("FEDAVG_TOPIC", "env-topic");
        env::set_var("FEDAVG_ROUNDS", "9");
        env::set_var("FEDAVG_RETRY_INTERVAL_MS", "250");

        let mut config = NodeConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.federation.topic, "env-topic");
        assert_eq!(config.federation.rounds, 9);
        assert_eq!(config.bootstrap.retry_interval_ms, 250);

        // Cleanup
        env::remove_var("FEDAVG_TOPIC");
        env::remove_var("FEDAVG_ROUNDS");
        env::remove_var("FEDAVG_RETRY_INTERVAL_MS");
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_duplicate_peer_id() {
        let mut config = NodeConfig::default();
        config.peers[1].id = "node-1".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("validation"));
    }

    #[test]
    fn test_validation_duplicate_addr() {
        let mut config = NodeConfig::default();
        config.peers[2].addr = config.peers[0].addr;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_rounds_and_retry() {
        let mut config = NodeConfig::default();
        config.federation.rounds = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.bootstrap.retry_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_unknown_identity() {
        let mut config = NodeConfig::default();
        config.node.id = Some("node-7".to_string());
        assert!(config.validate().is_err());

        config.node.id = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = NodeConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_select_node_by_id_and_index() {
        let mut config = NodeConfig::default();
        config.select_node("node-3").unwrap();
        assert_eq!(config.local_id().unwrap(), "node-3");

        config.select_node("2").unwrap();
        assert_eq!(config.local_id().unwrap(), "node-2");
        assert_eq!(config.local_index().unwrap(), 1);

        assert!(config.select_node("0").is_err());
        assert!(config.select_node("4").is_err());
        assert!(config.select_node("ghost").is_err());
    }

    #[test]
    fn test_derived_runtime_settings() {
        let mut config = NodeConfig::default();
        config.federation.quorum_timeout_secs = 30;
        config.select_node("node-2").unwrap();

        assert_eq!(config.coordinator_config().quorum_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.bootstrap_config().retry_interval, Duration::from_secs(2));
        assert!(config.bootstrap_config().timeout.is_none());
        assert_eq!(config.mesh_config().unwrap().listen_addr.port(), 7402);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[node]
id = "b"

[federation]
topic = "mnist"
rounds = 2

[[peers]]
id = "a"
addr = "10.0.0.1:9000"

[[peers]]
id = "b"
addr = "10.0.0.2:9000"

[logging]
level = "debug"
"#;

        let config = NodeConfig::from_toml(config_str).unwrap();

        assert_eq!(config.node.id.as_deref(), Some("b"));
        assert_eq!(config.federation.topic, "mnist");
        assert_eq!(config.federation.rounds, 2);
        assert_eq!(config.quorum(), 2);
        assert_eq!(config.bootstrap.retry_interval_ms, 2000);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_without_node_section_selects_nobody() {
        let config = NodeConfig::from_toml(
            "[[peers]]\nid = \"alpha\"\naddr = \"10.0.0.1:9000\"\n\n[[peers]]\nid = \"beta\"\naddr = \"10.0.0.2:9000\"\n",
        )
        .unwrap();
        assert!(config.node.id.is_none());
        assert!(config.validate().is_err());

        let mut config = config;
        config.select_node("beta").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_addr_is_parse_error() {
        let err = NodeConfig::from_toml("[[peers]]\nid = \"a\"\naddr = \"nowhere\"\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }
}
