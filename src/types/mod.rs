//! Type definitions shared across the node
//!
//! Holds the parameter data model that flows between the trainer,
//! the gossip channel and the round aggregator.

mod params;

pub use params::*;
