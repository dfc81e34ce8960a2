//! Transport capability: dialing peers and topic publish/subscribe
//!
//! The federation logic only depends on the [`Transport`] trait. Two
//! implementations ship with the node:
//! - [`TcpMesh`]: direct TCP connections with length-prefixed JSON frames
//! - [`MemoryTransport`]: in-process hub for tests and `simulate`

mod memory;
mod tcp;

pub use memory::*;
pub use tcp::*;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::peer::PeerEntry;

/// Queue depth for topic subscriptions
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Publish/subscribe and dial capability consumed by the federation
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the local endpoint; returns a printable listen address
    async fn listen(&self) -> Result<String>;

    /// Establish (or confirm) a persistent connection to a peer
    async fn dial(&self, peer: &PeerEntry) -> Result<()>;

    /// Broadcast bytes to every connected peer subscribed to `topic`
    ///
    /// Best effort: no acknowledgement, and the local node does not
    /// receive its own publications.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    /// Receive every publication on `topic` from any peer, unordered
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Ids of peers with at least one live connection
    fn connected_peers(&self) -> Vec<String>;
}

// ─────────────────────────────────────────────────────────────────
// Topic subscriptions (shared by both transports)
// ─────────────────────────────────────────────────────────────────

/// Local subscribers per topic
#[derive(Default)]
pub(crate) struct Subscriptions {
    topics: RwLock<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl Subscriptions {
    pub(crate) fn add(&self, topic: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut topics = self.topics.write();
        let subscribers = topics.entry(topic.to_string()).or_default();
        subscribers.retain(|s| !s.is_closed());
        subscribers.push(tx);
        rx
    }

    /// Hand `data` to every live subscriber of `topic`; returns how many got it
    pub(crate) async fn deliver(&self, topic: &str, data: Vec<u8>) -> usize {
        let subscribers: Vec<_> = match self.topics.read().get(topic) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for tx in subscribers {
            if tx.send(data.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}
