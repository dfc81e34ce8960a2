//! Whole federation in one process over a [`MemoryHub`]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::info;

use crate::error::{Error, Result};
use crate::peer::{BootstrapConfig, PeerDirectory, PeerEntry};
use crate::trainer::{LocalTrainer, LogisticConfig, LogisticTrainer};
use crate::transport::MemoryHub;

use super::{CoordinatorConfig, FederationCoordinator, FederationReport};

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub nodes: usize,
    pub coordinator: CoordinatorConfig,
    pub bootstrap: BootstrapConfig,
    pub trainer: LogisticConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            coordinator: CoordinatorConfig::default(),
            bootstrap: BootstrapConfig {
                retry_interval: Duration::from_millis(100),
                timeout: None,
            },
            trainer: LogisticConfig::default(),
        }
    }
}

/// `node-1..node-N` with placeholder loopback addresses
pub fn simulated_peers(nodes: usize) -> Vec<PeerEntry> {
    (0..nodes)
        .map(|i| {
            let port = 7401u16.saturating_add(i as u16);
            PeerEntry::new(format!("node-{}", i + 1), SocketAddr::from(([127, 0, 0, 1], port)))
        })
        .collect()
}

/// Run every node with the built-in logistic trainer
pub async fn run_simulation(config: SimulationConfig) -> Result<Vec<FederationReport>> {
    let trainer = config.trainer.clone();
    run_simulation_with(config, move |index| LogisticTrainer::new(trainer.clone(), index as u64)).await
}

/// Run every node with trainers from `make_trainer(node_index)`
///
/// Reports come back in node order. The first node error aborts the rest.
pub async fn run_simulation_with<T, F>(config: SimulationConfig, make_trainer: F) -> Result<Vec<FederationReport>>
where
    T: LocalTrainer + 'static,
    F: Fn(usize) -> Result<T>,
{
    if config.nodes == 0 {
        return Err(Error::config_field_invalid("nodes", "must be at least 1"));
    }

    let hub = MemoryHub::new();
    let peers = simulated_peers(config.nodes);

    info!(
        nodes = config.nodes,
        rounds = config.coordinator.rounds,
        "Starting in-process federation"
    );

    let mut tasks = JoinSet::new();
    for (index, peer) in peers.iter().enumerate() {
        let directory = PeerDirectory::new(peer.id.clone(), peers.clone(), config.bootstrap.clone())?;
        let coordinator = FederationCoordinator::new(
            config.coordinator.clone(),
            directory,
            Arc::new(hub.transport(peer.id.clone())),
            make_trainer(index)?,
        );
        tasks.spawn(async move { (index, coordinator.run().await) });
    }

    let mut reports: Vec<Option<FederationReport>> = vec![None; config.nodes];
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|e| Error::Internal(format!("node task failed: {}", e)))?;
        reports[index] = Some(result?);
    }

    Ok(reports.into_iter().flatten().collect())
}
