//! Round aggregator
//!
//! Turns the unordered stream of per-peer envelopes into exactly one
//! running sum per round, counting each author at most once.
//!
//! Per round: `Waiting` (0 contributions) → `Accumulating`
//! (1..quorum-1) → `Complete` (quorum). The running sum starts as
//! zeros shaped like the model, so every accepted contribution goes
//! through the same checked add. A contribution whose shapes disagree
//! is never merged; it marks the round as failed instead.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, ShapeError};
use crate::protocol::RoundEnvelope;
use crate::types::ParameterSet;

// ─────────────────────────────────────────────────────────────────
// Status and outcomes
// ─────────────────────────────────────────────────────────────────

/// Where the current round stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Waiting,
    Accumulating { received: usize, quorum: usize },
    Complete,
    Failed,
}

/// What happened to an offered envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Merged into the current round's sum
    Accepted { received: usize, quorum: usize },

    /// Author already counted this round
    Duplicate,

    /// Round index is neither current nor next
    Stale { round: u64 },

    /// Held back until the next round starts
    Deferred,

    /// Author is not a federation member
    Rejected,

    /// Current round already failed; nothing more is merged
    Ignored,
}

/// Running counters across all rounds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub deferred: u64,
    pub rejected: u64,
}

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

struct AggregationState {
    round: u64,
    sum: ParameterSet,
    seen: BTreeSet<String>,
    failure: Option<(String, ShapeError)>,

    /// Next-round payloads, at most one per author
    deferred: BTreeMap<String, ParameterSet>,

    stats: AggregatorStats,
}

/// Per-round quorum aggregation shared by the receive pump and the round loop
pub struct RoundAggregator {
    members: BTreeSet<String>,
    template: ParameterSet,
    state: Mutex<AggregationState>,

    /// Bumped on every state change so waiters can re-check
    progress: watch::Sender<u64>,
}

impl RoundAggregator {
    /// `members` are the authors that count toward quorum (self included);
    /// `template` fixes the layer names and shapes every contribution must match.
    pub fn new(members: BTreeSet<String>, template: &ParameterSet) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::config_validation("federation needs at least one member"));
        }

        let (progress, _) = watch::channel(0);
        Ok(Self {
            members,
            template: template.zeros_like(),
            state: Mutex::new(AggregationState {
                round: 0,
                sum: template.zeros_like(),
                seen: BTreeSet::new(),
                failure: None,
                deferred: BTreeMap::new(),
                stats: AggregatorStats::default(),
            }),
            progress,
        })
    }

    /// Contributions needed to complete a round
    pub fn quorum(&self) -> usize {
        self.members.len()
    }

    pub fn current_round(&self) -> u64 {
        self.state.lock().round
    }

    pub fn status(&self) -> RoundStatus {
        let state = self.state.lock();
        if state.failure.is_some() {
            RoundStatus::Failed
        } else if state.seen.is_empty() {
            RoundStatus::Waiting
        } else if state.seen.len() < self.quorum() {
            RoundStatus::Accumulating {
                received: state.seen.len(),
                quorum: self.quorum(),
            }
        } else {
            RoundStatus::Complete
        }
    }

    /// Authors counted so far this round
    pub fn contributors(&self) -> Vec<String> {
        self.state.lock().seen.iter().cloned().collect()
    }

    /// Members that have not contributed this round
    pub fn missing(&self) -> Vec<String> {
        let state = self.state.lock();
        self.members.difference(&state.seen).cloned().collect()
    }

    pub fn stats(&self) -> AggregatorStats {
        self.state.lock().stats.clone()
    }

    /// Feed one envelope into the aggregator
    ///
    /// Returns `Err(RoundAborted)` when the envelope belongs to the
    /// current round but cannot be added to the running sum.
    pub fn offer(&self, envelope: RoundEnvelope) -> Result<Offer> {
        let result = {
            let mut state = self.state.lock();
            self.offer_locked(&mut state, envelope)
        };

        if matches!(result, Ok(Offer::Accepted { .. }) | Err(_)) {
            self.progress.send_modify(|v| *v += 1);
        }
        result
    }

    fn offer_locked(&self, state: &mut AggregationState, envelope: RoundEnvelope) -> Result<Offer> {
        let RoundEnvelope {
            round_index,
            author_id,
            payload,
            ..
        } = envelope;

        if !self.members.contains(&author_id) {
            state.stats.rejected += 1;
            warn!(author = %author_id, round = round_index, "Rejecting envelope from unknown author");
            return Ok(Offer::Rejected);
        }

        if round_index == state.round + 1 {
            if state.deferred.contains_key(&author_id) {
                state.stats.duplicates += 1;
                return Ok(Offer::Duplicate);
            }
            debug!(author = %author_id, round = round_index, "Deferring next-round envelope");
            state.deferred.insert(author_id, payload);
            state.stats.deferred += 1;
            return Ok(Offer::Deferred);
        }

        if round_index != state.round {
            state.stats.stale += 1;
            debug!(
                author = %author_id,
                round = round_index,
                current = state.round,
                "Discarding envelope for another round"
            );
            return Ok(Offer::Stale { round: round_index });
        }

        if state.failure.is_some() {
            return Ok(Offer::Ignored);
        }

        if state.seen.contains(&author_id) {
            state.stats.duplicates += 1;
            debug!(author = %author_id, round = round_index, "Ignoring duplicate contribution");
            return Ok(Offer::Duplicate);
        }

        if let Err(source) = state.sum.add_assign(&payload) {
            warn!(author = %author_id, round = round_index, error = %source, "Contribution shape mismatch, aborting round");
            state.failure = Some((author_id.clone(), source.clone()));
            return Err(Error::RoundAborted {
                round: round_index,
                author: author_id,
                source,
            });
        }

        state.seen.insert(author_id.clone());
        state.stats.accepted += 1;
        let received = state.seen.len();
        let quorum = self.quorum();

        debug!(author = %author_id, round = round_index, received, quorum, "Accepted contribution");
        if received == quorum {
            info!(round = round_index, contributors = received, "Quorum reached");
        }

        Ok(Offer::Accepted { received, quorum })
    }

    /// Resolve once the current round is complete
    ///
    /// Fails with `RoundAborted` if the round failed, or `QuorumTimeout`
    /// when `timeout` elapses first. `None` waits indefinitely.
    pub async fn wait_for_quorum(&self, timeout: Option<Duration>) -> Result<()> {
        let mut progress = self.progress.subscribe();

        let waiting = async {
            loop {
                if let Some(outcome) = self.check_complete() {
                    return outcome;
                }
                if progress.changed().await.is_err() {
                    return Err(Error::Internal("aggregator progress channel closed".to_string()));
                }
            }
        };

        match timeout {
            None => waiting.await,
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::QuorumTimeout {
                    round: self.current_round(),
                    timeout_secs: limit.as_secs(),
                    missing: self.missing(),
                }),
            },
        }
    }

    fn check_complete(&self) -> Option<Result<()>> {
        let state = self.state.lock();
        if let Some((author, source)) = &state.failure {
            return Some(Err(Error::RoundAborted {
                round: state.round,
                author: author.clone(),
                source: source.clone(),
            }));
        }
        (state.seen.len() >= self.quorum()).then_some(Ok(()))
    }

    /// Copy of the completed round's running sum
    pub fn take_sum(&self) -> Result<ParameterSet> {
        let state = self.state.lock();
        if let Some((author, source)) = &state.failure {
            return Err(Error::RoundAborted {
                round: state.round,
                author: author.clone(),
                source: source.clone(),
            });
        }
        if state.seen.len() < self.quorum() {
            return Err(Error::RoundIncomplete {
                round: state.round,
                received: state.seen.len(),
                quorum: self.quorum(),
            });
        }
        Ok(state.sum.clone())
    }

    /// Move to the next round and replay envelopes held back for it
    ///
    /// Returns the new round index.
    pub fn advance(&self) -> u64 {
        let round = {
            let mut state = self.state.lock();
            state.round += 1;
            state.sum = self.template.clone();
            state.seen.clear();
            state.failure = None;

            let round = state.round;
            let deferred = std::mem::take(&mut state.deferred);
            for (author_id, payload) in deferred {
                let envelope = RoundEnvelope {
                    round_index: round,
                    author_id,
                    sent_at: None,
                    payload,
                };
                // A replayed shape fault marks the new round as failed
                let _ = self.offer_locked(&mut state, envelope);
            }
            round
        };

        self.progress.send_modify(|v| *v += 1);
        debug!(round, "Aggregator advanced");
        round
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
