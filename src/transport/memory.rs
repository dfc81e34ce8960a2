//! In-process transport
//!
//! A [`MemoryHub`] plays the role of the network for several nodes in
//! one process. Used by `fedavg-node simulate` and by the test suites,
//! where it can also script dial failures and record dial timing.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::peer::PeerEntry;

use super::{Subscriptions, Transport};

/// One recorded call to `dial`
#[derive(Debug, Clone)]
pub struct DialAttempt {
    pub from: String,
    pub to: String,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Default)]
struct NodeSlot {
    listening: RwLock<bool>,
    subscriptions: Subscriptions,
}

#[derive(Default)]
struct HubInner {
    nodes: RwLock<HashMap<String, Arc<NodeSlot>>>,

    /// Undirected links, stored with the smaller id first
    links: RwLock<BTreeSet<(String, String)>>,

    /// Remaining forced failures per (from, to)
    scripted_failures: Mutex<HashMap<(String, String), u32>>,

    attempts: Mutex<Vec<DialAttempt>>,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint for node `id`; it is unreachable until it calls `listen`
    pub fn transport(&self, id: impl Into<String>) -> MemoryTransport {
        let id = id.into();
        self.inner.nodes.write().entry(id.clone()).or_default();
        MemoryTransport {
            hub: self.clone(),
            local_id: id,
        }
    }

    /// Make the next `count` dials from `from` to `to` fail
    pub fn fail_next_dials(&self, from: &str, to: &str, count: u32) {
        self.inner
            .scripted_failures
            .lock()
            .insert((from.to_string(), to.to_string()), count);
    }

    /// Every dial `from` made towards `to`, oldest first
    pub fn dial_attempts(&self, from: &str, to: &str) -> Vec<DialAttempt> {
        self.inner
            .attempts
            .lock()
            .iter()
            .filter(|a| a.from == from && a.to == to)
            .cloned()
            .collect()
    }

    pub fn are_connected(&self, a: &str, b: &str) -> bool {
        self.inner.links.read().contains(&link_key(a, b))
    }

    /// Deliver raw bytes to `to`'s subscribers as if a peer had published them
    pub async fn inject(&self, to: &str, topic: &str, data: Vec<u8>) -> usize {
        let slot = self.inner.nodes.read().get(to).cloned();
        match slot {
            Some(slot) => slot.subscriptions.deliver(topic, data).await,
            None => 0,
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<NodeSlot>> {
        self.inner.nodes.read().get(id).cloned()
    }

    fn neighbours(&self, id: &str) -> Vec<String> {
        self.inner
            .links
            .read()
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn record(&self, from: &str, to: &str, succeeded: bool) {
        self.inner.attempts.lock().push(DialAttempt {
            from: from.to_string(),
            to: to.to_string(),
            at: Instant::now(),
            succeeded,
        });
    }

    fn try_connect(&self, from: &str, peer: &PeerEntry) -> Result<()> {
        {
            let mut scripted = self.inner.scripted_failures.lock();
            if let Some(remaining) = scripted.get_mut(&(from.to_string(), peer.id.clone())) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::dial_failed(&peer.id, peer.addr, "scripted failure"));
                }
            }
        }

        let listening = self.slot(&peer.id).map(|s| *s.listening.read()).unwrap_or(false);
        if !listening {
            return Err(Error::dial_failed(&peer.id, peer.addr, "connection refused"));
        }

        self.inner.links.write().insert(link_key(from, &peer.id));
        Ok(())
    }
}

/// One node's view of a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    local_id: String,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self) -> Result<String> {
        let slot = self
            .hub
            .slot(&self.local_id)
            .ok_or_else(|| Error::Internal(format!("node {} not registered with hub", self.local_id)))?;
        *slot.listening.write() = true;
        Ok(format!("memory://{}", self.local_id))
    }

    async fn dial(&self, peer: &PeerEntry) -> Result<()> {
        if peer.id == self.local_id || self.hub.are_connected(&self.local_id, &peer.id) {
            return Ok(());
        }

        let result = self.hub.try_connect(&self.local_id, peer);
        self.hub.record(&self.local_id, &peer.id, result.is_ok());
        if result.is_ok() {
            debug!(node = %self.local_id, peer = %peer.id, "Memory link established");
        }
        result
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let targets: Vec<Arc<NodeSlot>> = self
            .hub
            .neighbours(&self.local_id)
            .iter()
            .filter_map(|id| self.hub.slot(id))
            .collect();

        for slot in targets {
            slot.subscriptions.deliver(topic, data.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let slot = self
            .hub
            .slot(&self.local_id)
            .ok_or_else(|| Error::Internal(format!("node {} not registered with hub", self.local_id)))?;
        Ok(slot.subscriptions.add(topic))
    }

    fn connected_peers(&self) -> Vec<String> {
        let mut peers = self.hub.neighbours(&self.local_id);
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, port: u16) -> PeerEntry {
        PeerEntry::new(id, ([127, 0, 0, 1], port).into())
    }

    #[tokio::test]
    async fn test_dial_requires_listener() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-1");
        let b = hub.transport("node-2");

        assert!(a.dial(&entry("node-2", 7402)).await.is_err());
        b.listen().await.unwrap();
        a.dial(&entry("node-2", 7402)).await.unwrap();

        assert!(hub.are_connected("node-2", "node-1"));
        assert_eq!(b.connected_peers(), vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-1");
        hub.transport("node-2").listen().await.unwrap();
        hub.fail_next_dials("node-1", "node-2", 2);

        assert!(a.dial(&entry("node-2", 7402)).await.is_err());
        assert!(a.dial(&entry("node-2", 7402)).await.is_err());
        a.dial(&entry("node-2", 7402)).await.unwrap();

        let attempts = hub.dial_attempts("node-1", "node-2");
        assert_eq!(attempts.len(), 3);
        assert!(!attempts[0].succeeded);
        assert!(attempts[2].succeeded);
    }

    #[tokio::test]
    async fn test_publish_skips_self_and_unlinked_nodes() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-1");
        let b = hub.transport("node-2");
        let c = hub.transport("node-3");
        b.listen().await.unwrap();
        a.dial(&entry("node-2", 7402)).await.unwrap();

        let mut a_rx = a.subscribe("federation").await.unwrap();
        let mut b_rx = b.subscribe("federation").await.unwrap();
        let mut c_rx = c.subscribe("federation").await.unwrap();

        a.publish("federation", vec![7]).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), vec![7]);
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inject_reaches_subscriber() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-1");
        let mut rx = a.subscribe("federation").await.unwrap();

        assert_eq!(hub.inject("node-1", "federation", b"junk".to_vec()).await, 1);
        assert_eq!(rx.recv().await.unwrap(), b"junk");
        assert_eq!(hub.inject("node-9", "federation", vec![]).await, 0);
    }
}
