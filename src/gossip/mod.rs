//! Round-envelope gossip over one named topic

mod channel;

pub use channel::*;
