//! Round-synchronized federated averaging over a full peer mesh
//!
//! Every node trains one local epoch per round, gossips its parameters
//! to all peers, waits until a contribution from every member (itself
//! included) has arrived for that round, and installs the element-wise
//! mean before starting the next round.

pub mod cli;
pub mod config;
pub mod error;
pub mod federation;
pub mod gossip;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod trainer;
pub mod transport;
pub mod types;
pub mod version;

pub use error::{Error, Result};
