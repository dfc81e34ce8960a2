//! Wire protocol between federation peers
//!
//! Two layers: [`RoundEnvelope`] is the gossip-level message that the
//! aggregator understands, and [`PeerFrame`] is the connection-level
//! framing the TCP mesh uses to carry handshakes and topic publications.

mod envelope;
mod frame;

pub use envelope::*;
pub use frame::*;
