//! Local trainer capability
//!
//! The federation never looks inside the model. It only needs to run
//! one epoch over the node's own data partition, read the parameters
//! out, put averaged parameters back, and score the result.

mod logistic;

pub use logistic::*;

use std::fmt;

use crate::error::Result;
use crate::types::ParameterSet;

/// Outcome of one local epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// Epochs completed by this trainer, including this one
    pub epoch: u64,
    pub samples: usize,
    /// Mean training loss over the epoch's batches
    pub loss: f64,
}

/// Loss and accuracy on the held-out partition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loss {:.4}, accuracy {:.2}%", self.loss, self.accuracy * 100.0)
    }
}

/// A model plus the node's private data partition
///
/// Methods are synchronous; the coordinator runs them on the blocking pool.
pub trait LocalTrainer: Send {
    /// One pass over the local training partition
    fn train_one_epoch(&mut self) -> Result<EpochStats>;

    fn export_parameters(&self) -> ParameterSet;

    /// Replace the model parameters; shapes must match `export_parameters`
    fn import_parameters(&mut self, params: &ParameterSet) -> Result<()>;

    fn evaluate(&self) -> Result<Evaluation>;
}
