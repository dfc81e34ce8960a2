//! Publish and subscribe for `RoundEnvelope`s on a single topic
//!
//! Subscribers see envelopes in arrival order. Payloads that fail to
//! decode are logged and dropped, never surfaced.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::RoundEnvelope;
use crate::transport::Transport;

/// A single pub/sub topic carrying [`RoundEnvelope`]s
///
/// Publishing is fire-and-forget. Subscribers see envelopes from any
/// peer in arrival order, which may include stale rounds, future
/// rounds and duplicates; filtering is left to the aggregator.
#[derive(Clone)]
pub struct GossipChannel {
    transport: Arc<dyn Transport>,
    topic: String,
}

impl GossipChannel {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, envelope: &RoundEnvelope) -> Result<()> {
        let bytes = envelope.encode()?;
        debug!(
            topic = %self.topic,
            round = envelope.round_index,
            bytes = bytes.len(),
            "Publishing envelope"
        );
        self.transport.publish(&self.topic, bytes).await
    }

    /// Start receiving; each call opens an independent stream
    pub async fn subscribe(&self) -> Result<EnvelopeStream> {
        let rx = self.transport.subscribe(&self.topic).await?;
        Ok(EnvelopeStream {
            topic: self.topic.clone(),
            rx,
            malformed: 0,
        })
    }
}

/// Decoded envelopes from a topic subscription
pub struct EnvelopeStream {
    topic: String,
    rx: mpsc::Receiver<Vec<u8>>,
    malformed: u64,
}

impl EnvelopeStream {
    /// Next well-formed envelope; `None` once the transport is gone
    ///
    /// Undecodable payloads are logged and skipped.
    pub async fn next(&mut self) -> Option<RoundEnvelope> {
        loop {
            let bytes = self.rx.recv().await?;
            match RoundEnvelope::decode(&bytes) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    self.malformed += 1;
                    warn!(
                        topic = %self.topic,
                        bytes = bytes.len(),
                        error = %e,
                        "Discarding malformed envelope"
                    );
                }
            }
        }
    }

    /// Payloads discarded so far
    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}
