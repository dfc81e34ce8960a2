//! Round envelope: one peer's parameters for one round
//!
//! Serialized as JSON:
//!
//! ```json
//! { "round_index": 0, "author_id": "node-1", "sent_at": "...",
//!   "payload": { "dense": { "values": [[...], [...]], "shapes": [[...], [...]] } } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ParameterSet;

/// Wire wrapper tagging a parameter snapshot with its round and author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundEnvelope {
    /// Round this contribution belongs to
    pub round_index: u64,

    /// Peer that trained the payload
    pub author_id: String,

    /// When the author published it (informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,

    /// The author's parameters after local training
    pub payload: ParameterSet,
}

impl RoundEnvelope {
    /// Wrap a freshly exported parameter set, stamped with the current time
    pub fn new(round_index: u64, author_id: impl Into<String>, payload: ParameterSet) -> Self {
        Self {
            round_index,
            author_id: author_id.into(),
            sent_at: Some(Utc::now()),
            payload,
        }
    }

    /// Serialize for the wire
    ///
    /// JSON has no NaN or infinity, so a non-finite payload is refused
    /// here instead of reaching peers as `null`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.payload.is_finite() {
            return Err(Error::training_failed(format!(
                "round {} parameters from {} contain non-finite values",
                self.round_index, self.author_id
            )));
        }
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("Failed to encode envelope: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: RoundEnvelope = serde_json::from_slice(bytes)?;
        if envelope.author_id.is_empty() {
            return Err(Error::malformed("envelope has an empty author_id"));
        }
        Ok(envelope)
    }

    /// Strip the round/author tags, keeping only the parameters
    pub fn into_payload(self) -> ParameterSet {
        self.payload
    }
}
