//! Federation membership
//!
//! Every node knows the full peer list up front. The directory turns
//! that list into a live connection set before round 0 starts.

pub mod directory;

pub use directory::*;
