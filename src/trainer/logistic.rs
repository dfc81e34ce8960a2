//! Built-in logistic-regression trainer on a synthetic partition
//!
//! All nodes share `dataset_seed`, which fixes the hidden decision
//! boundary and the initial weights. Each node's samples are drawn
//! from its own stream (seed mixed with the partition index), so the
//! partitions differ while the task stays the same.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{LayerWeights, ParameterSet, Tensor};

use super::{EpochStats, Evaluation, LocalTrainer};

/// Layer name used in exported parameter sets
pub const DENSE_LAYER: &str = "dense";

const LABEL_NOISE: f64 = 0.05;
const LOSS_EPSILON: f64 = 1e-7;

/// Synthetic dataset and SGD settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticConfig {
    /// Input dimension
    pub features: usize,

    /// Samples per node for training
    pub train_samples: usize,

    /// Samples per node for evaluation
    pub test_samples: usize,

    pub learning_rate: f64,

    pub batch_size: usize,

    /// Shared by every node in the federation
    pub dataset_seed: u64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            features: 8,
            train_samples: 512,
            test_samples: 128,
            learning_rate: 0.1,
            batch_size: 10,
            dataset_seed: 42,
        }
    }
}

impl LogisticConfig {
    pub fn validate(&self) -> Result<()> {
        if self.features == 0 {
            return Err(Error::config_field_invalid("trainer.features", "must be at least 1"));
        }
        if self.train_samples == 0 || self.test_samples == 0 {
            return Err(Error::config_field_invalid(
                "trainer.train_samples",
                "train and test partitions must not be empty",
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::config_field_invalid("trainer.batch_size", "must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config_field_invalid(
                "trainer.learning_rate",
                "must be a positive number",
            ));
        }
        Ok(())
    }
}

struct Samples {
    /// Row-major, `features` values per sample
    inputs: Vec<f64>,
    labels: Vec<f64>,
}

impl Samples {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn row(&self, i: usize, features: usize) -> &[f64] {
        &self.inputs[i * features..(i + 1) * features]
    }
}

/// Single dense layer with a sigmoid output, trained with mini-batch SGD
pub struct LogisticTrainer {
    config: LogisticConfig,
    weights: Vec<f64>,
    bias: f64,
    train: Samples,
    test: Samples,
    rng: StdRng,
    epochs: u64,
}

impl LogisticTrainer {
    /// Build the trainer for partition `partition` (the node's index)
    pub fn new(config: LogisticConfig, partition: u64) -> Result<Self> {
        config.validate()?;
        let features = config.features;

        let mut shared = StdRng::seed_from_u64(config.dataset_seed);
        let true_weights: Vec<f64> = (0..features).map(|_| shared.random_range(-1.0..1.0)).collect();
        let true_bias = shared.random_range(-0.5..0.5);
        let weights: Vec<f64> = (0..features).map(|_| shared.random_range(-0.1..0.1)).collect();

        let partition_seed = config
            .dataset_seed
            .wrapping_add((partition + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut rng = StdRng::seed_from_u64(partition_seed);

        let mut draw = |count: usize| {
            let mut inputs = Vec::with_capacity(count * features);
            let mut labels = Vec::with_capacity(count);
            for _ in 0..count {
                let row: Vec<f64> = (0..features).map(|_| rng.random_range(-1.0..1.0)).collect();
                let margin = dot(&row, &true_weights) + true_bias + rng.random_range(-LABEL_NOISE..LABEL_NOISE);
                labels.push(if margin > 0.0 { 1.0 } else { 0.0 });
                inputs.extend(row);
            }
            Samples { inputs, labels }
        };

        let train = draw(config.train_samples);
        let test = draw(config.test_samples);

        debug!(
            partition,
            features,
            train = train.len(),
            test = test.len(),
            "Synthetic partition generated"
        );

        Ok(Self {
            config,
            weights,
            bias: 0.0,
            train,
            test,
            rng,
            epochs: 0,
        })
    }

    pub fn config(&self) -> &LogisticConfig {
        &self.config
    }

    fn predict(&self, row: &[f64]) -> f64 {
        sigmoid(dot(row, &self.weights) + self.bias)
    }

    fn score(&self, samples: &Samples) -> Evaluation {
        let features = self.config.features;
        let mut loss = 0.0;
        let mut correct = 0usize;

        for i in 0..samples.len() {
            let p = self.predict(samples.row(i, features));
            let y = samples.labels[i];
            loss += cross_entropy(p, y);
            if (p >= 0.5) == (y >= 0.5) {
                correct += 1;
            }
        }

        let n = samples.len().max(1) as f64;
        Evaluation {
            loss: loss / n,
            accuracy: correct as f64 / n,
        }
    }
}

impl LocalTrainer for LogisticTrainer {
    fn train_one_epoch(&mut self) -> Result<EpochStats> {
        let features = self.config.features;
        let mut order: Vec<usize> = (0..self.train.len()).collect();
        order.shuffle(&mut self.rng);

        let mut total_loss = 0.0;
        let mut grad = vec![0.0; features];

        for batch in order.chunks(self.config.batch_size) {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_bias = 0.0;

            for &i in batch {
                let row = self.train.row(i, features);
                let y = self.train.labels[i];
                let p = self.predict(row);
                total_loss += cross_entropy(p, y);

                let err = p - y;
                for (g, x) in grad.iter_mut().zip(row) {
                    *g += err * x;
                }
                grad_bias += err;
            }

            let step = self.config.learning_rate / batch.len() as f64;
            for (w, g) in self.weights.iter_mut().zip(&grad) {
                *w -= step * g;
            }
            self.bias -= step * grad_bias;
        }

        let loss = total_loss / self.train.len() as f64;
        if !loss.is_finite() || !self.bias.is_finite() {
            return Err(Error::training_failed(format!(
                "loss diverged in epoch {}",
                self.epochs + 1
            )));
        }

        self.epochs += 1;
        Ok(EpochStats {
            epoch: self.epochs,
            samples: self.train.len(),
            loss,
        })
    }

    fn export_parameters(&self) -> ParameterSet {
        let kernel = Tensor::column(self.weights.clone());
        let bias = Tensor::vector(vec![self.bias]);

        let mut set = ParameterSet::new();
        set.insert(DENSE_LAYER, LayerWeights::new(kernel, bias));
        set
    }

    fn import_parameters(&mut self, params: &ParameterSet) -> Result<()> {
        self.export_parameters()
            .check_compatible(params)
            .map_err(|e| Error::ImportFailed { message: e.to_string() })?;
        if !params.is_finite() {
            return Err(Error::ImportFailed {
                message: "parameters contain NaN or infinite values".to_string(),
            });
        }

        let layer = params.get(DENSE_LAYER).ok_or_else(|| Error::ImportFailed {
            message: format!("missing layer '{}'", DENSE_LAYER),
        })?;
        self.weights.copy_from_slice(layer.kernel.values());
        self.bias = layer.bias.values()[0];
        Ok(())
    }

    fn evaluate(&self) -> Result<Evaluation> {
        Ok(self.score(&self.test))
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn cross_entropy(p: f64, y: f64) -> f64 {
    let p = p.clamp(LOSS_EPSILON, 1.0 - LOSS_EPSILON);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}
