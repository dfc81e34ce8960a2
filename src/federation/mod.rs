//! Round-synchronized federated averaging
//!
//! - [`RoundAggregator`]: per-round dedup, round filtering and quorum
//! - [`FederationCoordinator`]: the node's train/publish/average loop
//! - [`simulation`]: a whole federation inside one process

pub mod aggregator;
pub mod coordinator;
pub mod simulation;

pub use aggregator::*;
pub use coordinator::*;
pub use simulation::{run_simulation, run_simulation_with, SimulationConfig};
