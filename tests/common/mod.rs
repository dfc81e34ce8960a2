//! Common test utilities and fixtures
//!
//! Shared by the federation and mesh integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use parking_lot::Mutex;

use fedavg_node::error::Result;
use fedavg_node::trainer::{EpochStats, Evaluation, LocalTrainer};
use fedavg_node::types::{LayerWeights, ParameterSet, Tensor};

pub const LAYER: &str = "dense";

/// Single-layer parameter set with the given kernel and bias values
pub fn dense(kernel: &[f64], bias: &[f64]) -> ParameterSet {
    let mut set = ParameterSet::new();
    set.insert(
        LAYER,
        LayerWeights::new(Tensor::vector(kernel.to_vec()), Tensor::vector(bias.to_vec())),
    );
    set
}

/// `(kernel, bias)` values of the `dense` layer
pub fn dense_values(set: &ParameterSet) -> (Vec<f64>, Vec<f64>) {
    let layer = set.get(LAYER).unwrap();
    (layer.kernel.values().to_vec(), layer.bias.values().to_vec())
}

/// Trainer whose "training" installs a fixed parameter set per round
///
/// Every parameter set it receives through `import_parameters` is
/// recorded in `installed`.
pub struct ScriptedTrainer {
    script: Vec<ParameterSet>,
    current: ParameterSet,
    epochs: usize,
    pub installed: Arc<Mutex<Vec<ParameterSet>>>,
}

impl ScriptedTrainer {
    pub fn new(script: Vec<ParameterSet>) -> Self {
        let current = script[0].zeros_like();
        Self {
            script,
            current,
            epochs: 0,
            installed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Same contribution in every round
    pub fn constant(params: ParameterSet) -> Self {
        Self::new(vec![params])
    }
}

impl LocalTrainer for ScriptedTrainer {
    fn train_one_epoch(&mut self) -> Result<EpochStats> {
        let index = self.epochs.min(self.script.len() - 1);
        self.current = self.script[index].clone();
        self.epochs += 1;
        Ok(EpochStats {
            epoch: self.epochs as u64,
            samples: 1,
            loss: 0.0,
        })
    }

    fn export_parameters(&self) -> ParameterSet {
        self.current.clone()
    }

    fn import_parameters(&mut self, params: &ParameterSet) -> Result<()> {
        self.installed.lock().push(params.clone());
        self.current = params.clone();
        Ok(())
    }

    fn evaluate(&self) -> Result<Evaluation> {
        Ok(Evaluation {
            loss: 0.0,
            accuracy: 1.0,
        })
    }
}

/// Loopback addresses with ports that were free a moment ago
pub fn free_loopback_addrs(count: usize) -> Vec<SocketAddr> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_trainer_cycles_script() {
        let mut trainer = ScriptedTrainer::new(vec![dense(&[1.0], &[2.0]), dense(&[5.0], &[6.0])]);
        assert_eq!(dense_values(&trainer.export_parameters()), (vec![0.0], vec![0.0]));

        trainer.train_one_epoch().unwrap();
        assert_eq!(dense_values(&trainer.export_parameters()).0, vec![1.0]);
        trainer.train_one_epoch().unwrap();
        trainer.train_one_epoch().unwrap();
        assert_eq!(dense_values(&trainer.export_parameters()).0, vec![5.0]);
    }

    #[test]
    fn test_free_loopback_addrs_are_distinct() {
        let addrs = free_loopback_addrs(3);
        assert_ne!(addrs[0], addrs[1]);
        assert_ne!(addrs[1], addrs[2]);
    }
}
