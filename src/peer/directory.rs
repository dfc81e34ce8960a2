//! Peer directory: the static federation membership and its bootstrap
//!
//! Every node is configured with the same ordered peer list (itself
//! included). Bootstrap opens the local endpoint, then keeps dialing
//! the peers that are not yet connected, one pass every
//! `retry_interval`, until all of them are. Rounds never start on a
//! partial mesh.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::Transport;

// ─────────────────────────────────────────────────────────────────
// Peer entries
// ─────────────────────────────────────────────────────────────────

/// One configured federation member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEntry {
    pub id: String,
    pub addr: SocketAddr,
}

impl PeerEntry {
    pub fn new(id: impl Into<String>, addr: SocketAddr) -> Self {
        Self { id: id.into(), addr }
    }
}

impl fmt::Display for PeerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

// ─────────────────────────────────────────────────────────────────
// Bootstrap settings and outcome
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Pause between dialing passes (fixed, no backoff)
    pub retry_interval: Duration,

    /// Give up after this long; `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(2),
            timeout: None,
        }
    }
}

/// What bootstrap did before the mesh was complete
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub listen_addr: String,
    pub passes: u32,
    /// Dial attempts per remote peer id
    pub attempts: HashMap<String, u32>,
    pub elapsed: Duration,
}

// ─────────────────────────────────────────────────────────────────
// Directory
// ─────────────────────────────────────────────────────────────────

pub struct PeerDirectory {
    local_id: String,
    peers: Vec<PeerEntry>,
    config: BootstrapConfig,
    connected: RwLock<BTreeSet<String>>,
}

impl PeerDirectory {
    /// `peers` is the full ordered membership and must contain `local_id`
    pub fn new(local_id: impl Into<String>, peers: Vec<PeerEntry>, config: BootstrapConfig) -> Result<Self> {
        let local_id = local_id.into();

        if !peers.iter().any(|p| p.id == local_id) {
            return Err(Error::config_field_invalid(
                "node.id",
                format!("'{}' is not one of the configured peers", local_id),
            ));
        }

        let mut seen = BTreeSet::new();
        if let Some(dup) = peers.iter().find(|p| !seen.insert(p.id.as_str())) {
            return Err(Error::config_field_invalid(
                "peers",
                format!("duplicate peer id '{}'", dup.id),
            ));
        }

        Ok(Self {
            local_id,
            peers,
            config,
            connected: RwLock::new(BTreeSet::new()),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_entry(&self) -> Option<&PeerEntry> {
        self.peers.iter().find(|p| p.id == self.local_id)
    }

    /// Full membership, self included
    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    /// Membership without self
    pub fn remote_peers(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.iter().filter(move |p| p.id != self.local_id)
    }

    pub fn member_ids(&self) -> BTreeSet<String> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }

    /// Contributions needed per round: every member, self included
    pub fn quorum(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        peer_id == self.local_id || self.connected.read().contains(peer_id)
    }

    /// Remote peers not yet connected, in configured order
    pub fn pending(&self) -> Vec<String> {
        let connected = self.connected.read();
        self.remote_peers()
            .filter(|p| !connected.contains(&p.id))
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn all_connected(&self) -> bool {
        self.pending().is_empty()
    }

    /// Open the local endpoint and dial until every remote peer is connected
    pub async fn bootstrap<T: Transport + ?Sized>(&self, transport: &T) -> Result<BootstrapReport> {
        let started = Instant::now();
        let listen_addr = transport.listen().await?;
        info!(
            node = %self.local_id,
            addr = %listen_addr,
            peers = self.peers.len(),
            "Bootstrapping peer mesh"
        );

        let mut attempts = HashMap::new();
        let mut passes = 0;

        let dialing = self.dial_until_connected(transport, &mut attempts, &mut passes);
        match self.config.timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, dialing).await.is_err() {
                    let pending = self.pending();
                    warn!(pending = ?pending, "Bootstrap timed out");
                    return Err(Error::BootstrapTimeout {
                        timeout_secs: limit.as_secs(),
                        pending,
                    });
                }
            }
            None => dialing.await,
        }

        let elapsed = started.elapsed();
        info!(
            node = %self.local_id,
            passes,
            elapsed_ms = elapsed.as_millis() as u64,
            "All peers connected"
        );

        Ok(BootstrapReport {
            listen_addr,
            passes,
            attempts,
            elapsed,
        })
    }

    async fn dial_until_connected<T: Transport + ?Sized>(
        &self,
        transport: &T,
        attempts: &mut HashMap<String, u32>,
        passes: &mut u32,
    ) {
        loop {
            *passes += 1;

            let pending: Vec<PeerEntry> = self
                .remote_peers()
                .filter(|p| !self.is_connected(&p.id))
                .cloned()
                .collect();

            for peer in &pending {
                *attempts.entry(peer.id.clone()).or_insert(0) += 1;

                match transport.dial(peer).await {
                    Ok(()) => {
                        info!(peer = %peer.id, addr = %peer.addr, "Connected to peer");
                        self.connected.write().insert(peer.id.clone());
                    }
                    Err(e) => {
                        debug!(peer = %peer.id, pass = *passes, error = %e, "Dial failed, will retry");
                    }
                }
            }

            let remaining = self.pending();
            if remaining.is_empty() {
                return;
            }

            info!(
                remaining = remaining.len(),
                pending = ?remaining,
                retry_in_ms = self.config.retry_interval.as_millis() as u64,
                "Waiting for peers"
            );
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
