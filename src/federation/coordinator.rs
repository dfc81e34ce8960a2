//! Federation coordinator: the per-node round loop
//!
//! `BOOTSTRAP → (TRAIN → PUBLISH → AWAIT_QUORUM → AGGREGATE → INSTALL)×rounds`
//!
//! The node's own contribution is fed into the aggregator exactly like
//! a received one, so quorum is the full membership including self.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gossip::GossipChannel;
use crate::peer::{BootstrapReport, PeerDirectory};
use crate::protocol::RoundEnvelope;
use crate::trainer::{EpochStats, Evaluation, LocalTrainer};
use crate::transport::Transport;
use crate::types::ParameterSet;

use super::aggregator::{AggregatorStats, RoundAggregator};

/// Default topic shared by every node of a federation
pub const DEFAULT_TOPIC: &str = "federation";

/// Default number of communication rounds
pub const DEFAULT_ROUNDS: u64 = 5;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub topic: String,
    pub rounds: u64,

    /// Per-round quorum wait; `None` waits forever
    pub quorum_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            rounds: DEFAULT_ROUNDS,
            quorum_timeout: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────

/// One completed round as seen by this node
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round: u64,
    /// Authors averaged into this round, sorted
    pub contributors: Vec<String>,
    pub epoch: EpochStats,
    /// Local model after training, before averaging
    pub local: Evaluation,
    /// Shared model after installing the average
    pub averaged: Evaluation,
    pub elapsed: Duration,
}

/// Everything a finished federation run produced on this node
#[derive(Debug, Clone)]
pub struct FederationReport {
    pub node_id: String,
    pub bootstrap: BootstrapReport,
    pub rounds: Vec<RoundSummary>,
    pub final_parameters: ParameterSet,
    pub aggregator: AggregatorStats,
    pub elapsed: Duration,
}

impl FederationReport {
    pub fn final_evaluation(&self) -> Option<Evaluation> {
        self.rounds.last().map(|r| r.averaged)
    }
}

/// Aborts the receive pump however `run` exits
struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

pub struct FederationCoordinator<T> {
    config: CoordinatorConfig,
    directory: PeerDirectory,
    transport: Arc<dyn Transport>,
    trainer: Arc<Mutex<T>>,
}

impl<T: LocalTrainer + 'static> FederationCoordinator<T> {
    pub fn new(
        config: CoordinatorConfig,
        directory: PeerDirectory,
        transport: Arc<dyn Transport>,
        trainer: T,
    ) -> Self {
        Self {
            config,
            directory,
            transport,
            trainer: Arc::new(Mutex::new(trainer)),
        }
    }

    pub fn local_id(&self) -> &str {
        self.directory.local_id()
    }

    /// Run the configured number of rounds to completion
    pub async fn run(self) -> Result<FederationReport> {
        let started = Instant::now();
        let local_id = self.directory.local_id().to_string();

        let template = self.trainer.lock().export_parameters();
        let aggregator = Arc::new(RoundAggregator::new(self.directory.member_ids(), &template)?);

        // Subscribe before dialing so early contributions are kept
        let gossip = GossipChannel::new(Arc::clone(&self.transport), self.config.topic.clone());
        let mut stream = gossip.subscribe().await?;
        let pump = {
            let aggregator = Arc::clone(&aggregator);
            PumpGuard(tokio::spawn(async move {
                while let Some(envelope) = stream.next().await {
                    let (round, author) = (envelope.round_index, envelope.author_id.clone());
                    match aggregator.offer(envelope) {
                        Ok(outcome) => debug!(round, author = %author, outcome = ?outcome, "Envelope offered"),
                        Err(e) => warn!(round, author = %author, error = %e, "Contribution rejected"),
                    }
                }
                debug!("Gossip stream closed");
            }))
        };

        let bootstrap = self.directory.bootstrap(self.transport.as_ref()).await?;

        info!(
            node = %local_id,
            rounds = self.config.rounds,
            quorum = aggregator.quorum(),
            topic = %self.config.topic,
            "Federation starting"
        );

        let mut rounds = Vec::with_capacity(self.config.rounds as usize);
        for round in 0..self.config.rounds {
            let summary = self.run_round(round, &local_id, &gossip, &aggregator).await?;
            rounds.push(summary);
            aggregator.advance();
        }
        drop(pump);

        let final_parameters = self.with_trainer(|t| Ok(t.export_parameters())).await?;
        let elapsed = started.elapsed();

        info!(
            node = %local_id,
            rounds = rounds.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Federation finished"
        );

        Ok(FederationReport {
            node_id: local_id,
            bootstrap,
            rounds,
            final_parameters,
            aggregator: aggregator.stats(),
            elapsed,
        })
    }

    async fn run_round(
        &self,
        round: u64,
        local_id: &str,
        gossip: &GossipChannel,
        aggregator: &RoundAggregator,
    ) -> Result<RoundSummary> {
        let started = Instant::now();
        debug_assert_eq!(aggregator.current_round(), round);
        info!(round, "Round started");

        // TRAIN
        let epoch = self.with_trainer(|t| t.train_one_epoch()).await?;
        let local = self.with_trainer(|t| t.evaluate()).await?;
        info!(
            round,
            train_loss = epoch.loss,
            loss = local.loss,
            accuracy = local.accuracy,
            "Local epoch complete"
        );

        // PUBLISH
        let params = self.with_trainer(|t| Ok(t.export_parameters())).await?;
        let envelope = RoundEnvelope::new(round, local_id, params);
        gossip.publish(&envelope).await?;
        aggregator.offer(envelope)?;
        info!(round, "Contribution published");

        // AWAIT_QUORUM
        aggregator.wait_for_quorum(self.config.quorum_timeout).await?;

        // AGGREGATE
        let contributors = aggregator.contributors();
        let mut average = aggregator.take_sum()?;
        average.divide_by(aggregator.quorum() as f64);

        // INSTALL
        self.with_trainer(move |t| t.import_parameters(&average)).await?;
        let averaged = self.with_trainer(|t| t.evaluate()).await?;

        let elapsed = started.elapsed();
        info!(
            round,
            contributors = contributors.len(),
            loss = averaged.loss,
            accuracy = averaged.accuracy,
            elapsed_ms = elapsed.as_millis() as u64,
            "Round complete, averaged model installed"
        );

        Ok(RoundSummary {
            round,
            contributors,
            epoch,
            local,
            averaged,
            elapsed,
        })
    }

    /// Run a trainer call on the blocking pool
    async fn with_trainer<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> Result<R> + Send + 'static,
    {
        let trainer = Arc::clone(&self.trainer);
        tokio::task::spawn_blocking(move || f(&mut trainer.lock()))
            .await
            .map_err(|e| Error::training_failed(format!("trainer task failed: {}", e)))?
    }
}
