//! Trainable state exchanged between nodes
//!
//! A [`ParameterSet`] maps layer names to a kernel/bias pair of flat
//! `f64` tensors. Shapes never change once exported; only values do.
//! Arithmetic between two sets requires identical layer names and
//! shapes and is checked before any element is touched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ShapeError;

// ─────────────────────────────────────────────────────────────────
// Tensor
// ─────────────────────────────────────────────────────────────────

/// Flat values plus the dimensions they are laid out in (row-major)
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    values: Vec<f64>,
    shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor, checking that the value count matches the shape
    pub fn new(values: Vec<f64>, shape: Vec<usize>) -> Result<Self, ShapeError> {
        let expected = element_count(&shape)?;
        if values.len() != expected {
            return Err(ShapeError::ValueCount {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { values, shape })
    }

    /// All-zero tensor of the given shape
    pub fn zeros(shape: Vec<usize>) -> Result<Self, ShapeError> {
        let count = element_count(&shape)?;
        Ok(Self {
            values: vec![0.0; count],
            shape,
        })
    }

    /// All-zero tensor with this tensor's shape
    pub fn zeros_like(&self) -> Self {
        Self {
            values: vec![0.0; self.values.len()],
            shape: self.shape.clone(),
        }
    }

    /// One-dimensional tensor, shape `[n]`
    pub fn vector(values: Vec<f64>) -> Self {
        let shape = vec![values.len()];
        Self { values, shape }
    }

    /// Column matrix, shape `[n, 1]`
    pub fn column(values: Vec<f64>) -> Self {
        let shape = vec![values.len(), 1];
        Self { values, shape }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Scalars are shape `[]` and hold one value
fn element_count(shape: &[usize]) -> Result<usize, ShapeError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| ShapeError::Overflow { shape: shape.to_vec() })
}

// ─────────────────────────────────────────────────────────────────
// Layer Weights
// ─────────────────────────────────────────────────────────────────

/// Kernel and bias of one layer
///
/// On the wire a layer is `{"values": [kernel, bias], "shapes": [kernel_shape, bias_shape]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireLayer", into = "WireLayer")]
pub struct LayerWeights {
    pub kernel: Tensor,
    pub bias: Tensor,
}

impl LayerWeights {
    pub fn new(kernel: Tensor, bias: Tensor) -> Self {
        Self { kernel, bias }
    }

    fn zeros_like(&self) -> Self {
        Self {
            kernel: self.kernel.zeros_like(),
            bias: self.bias.zeros_like(),
        }
    }

    fn parts(&self) -> [(&'static str, &Tensor); 2] {
        [("kernel", &self.kernel), ("bias", &self.bias)]
    }

    fn parts_mut(&mut self) -> [&mut Tensor; 2] {
        [&mut self.kernel, &mut self.bias]
    }
}

#[derive(Serialize, Deserialize)]
struct WireLayer {
    values: [Vec<f64>; 2],
    shapes: [Vec<usize>; 2],
}

impl TryFrom<WireLayer> for LayerWeights {
    type Error = ShapeError;

    fn try_from(wire: WireLayer) -> Result<Self, Self::Error> {
        let [kernel_values, bias_values] = wire.values;
        let [kernel_shape, bias_shape] = wire.shapes;
        Ok(Self {
            kernel: Tensor::new(kernel_values, kernel_shape)?,
            bias: Tensor::new(bias_values, bias_shape)?,
        })
    }
}

impl From<LayerWeights> for WireLayer {
    fn from(layer: LayerWeights) -> Self {
        Self {
            values: [layer.kernel.values, layer.bias.values],
            shapes: [layer.kernel.shape, layer.bias.shape],
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Parameter Set
// ─────────────────────────────────────────────────────────────────

/// Named layers of one node's (or the federation's) trainable state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    layers: BTreeMap<String, LayerWeights>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a layer, returning the previous weights
    pub fn insert(&mut self, name: impl Into<String>, weights: LayerWeights) -> Option<LayerWeights> {
        self.layers.insert(name.into(), weights)
    }

    pub fn get(&self, name: &str) -> Option<&LayerWeights> {
        self.layers.get(name)
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &LayerWeights)> {
        self.layers.iter().map(|(name, w)| (name.as_str(), w))
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.keys().map(String::as_str).collect()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Total number of scalar parameters across all layers
    pub fn num_parameters(&self) -> usize {
        self.layers
            .values()
            .map(|w| w.kernel.len() + w.bias.len())
            .sum()
    }

    /// Same layers and shapes, every value zero
    pub fn zeros_like(&self) -> Self {
        Self {
            layers: self
                .layers
                .iter()
                .map(|(name, w)| (name.clone(), w.zeros_like()))
                .collect(),
        }
    }

    /// Check that `other` has exactly our layer names and shapes
    pub fn check_compatible(&self, other: &ParameterSet) -> Result<(), ShapeError> {
        for name in self.layers.keys() {
            if !other.layers.contains_key(name) {
                return Err(ShapeError::MissingLayer {
                    layer: name.clone(),
                    side: "incoming",
                });
            }
        }
        for (name, theirs) in &other.layers {
            let ours = self.layers.get(name).ok_or_else(|| ShapeError::MissingLayer {
                layer: name.clone(),
                side: "local",
            })?;
            for ((part, mine), (_, incoming)) in ours.parts().into_iter().zip(theirs.parts()) {
                if mine.shape != incoming.shape {
                    return Err(ShapeError::Mismatch {
                        layer: name.clone(),
                        part,
                        expected: mine.shape.clone(),
                        actual: incoming.shape.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Element-wise `self += other` for kernel and bias of every layer
    ///
    /// Shapes are validated up front, so on error `self` is untouched.
    pub fn add_assign(&mut self, other: &ParameterSet) -> Result<(), ShapeError> {
        self.check_compatible(other)?;
        for (name, ours) in self.layers.iter_mut() {
            let theirs = &other.layers[name];
            for (dst, src) in ours.parts_mut().into_iter().zip([&theirs.kernel, &theirs.bias]) {
                for (d, s) in dst.values.iter_mut().zip(&src.values) {
                    *d += s;
                }
            }
        }
        Ok(())
    }

    /// Divide every element in place
    pub fn divide_by(&mut self, divisor: f64) {
        for layer in self.layers.values_mut() {
            for tensor in layer.parts_mut() {
                tensor.values.iter_mut().for_each(|v| *v /= divisor);
            }
        }
    }

    /// True when every value is finite (no NaN or infinity)
    pub fn is_finite(&self) -> bool {
        self.layers
            .values()
            .flat_map(|w| w.kernel.values.iter().chain(&w.bias.values))
            .all(|v| v.is_finite())
    }
}

impl FromIterator<(String, LayerWeights)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, LayerWeights)>>(iter: I) -> Self {
        Self {
            layers: iter.into_iter().collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(kernel: Vec<f64>, bias: Vec<f64>) -> ParameterSet {
        let mut set = ParameterSet::new();
        let k = kernel.len();
        let b = bias.len();
        set.insert(
            "dense",
            LayerWeights::new(
                Tensor::new(kernel, vec![k, 1]).unwrap(),
                Tensor::new(bias, vec![b]).unwrap(),
            ),
        );
        set
    }

    #[test]
    fn test_tensor_rejects_wrong_value_count() {
        let err = Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]).unwrap_err();
        assert_eq!(
            err,
            ShapeError::ValueCount {
                shape: vec![2, 2],
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_zeros_like_keeps_shapes() {
        let set = dense(vec![1.0, 2.0], vec![3.0]);
        let zeros = set.zeros_like();
        assert!(set.check_compatible(&zeros).is_ok());
        assert_eq!(zeros.get("dense").unwrap().kernel.values(), &[0.0, 0.0]);
        assert_eq!(zeros.num_parameters(), 3);
    }

    #[test]
    fn test_add_then_divide_is_mean() {
        let mut sum = dense(vec![0.0], vec![0.0]);
        for (k, b) in [(1.0, 2.0), (3.0, 4.0), (5.0, 6.0)] {
            sum.add_assign(&dense(vec![k], vec![b])).unwrap();
        }
        sum.divide_by(3.0);

        let layer = sum.get("dense").unwrap();
        assert!((layer.kernel.values()[0] - 3.0).abs() < 1e-12);
        assert!((layer.bias.values()[0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_add_shape_mismatch_leaves_target_untouched() {
        let mut sum = dense(vec![1.0, 1.0], vec![1.0]);
        let before = sum.clone();

        let err = sum.add_assign(&dense(vec![1.0, 1.0, 1.0], vec![1.0])).unwrap_err();
        assert!(matches!(err, ShapeError::Mismatch { part: "kernel", .. }));
        assert_eq!(sum, before);
    }

    #[test]
    fn test_add_missing_layer_is_reported() {
        let mut sum = dense(vec![1.0], vec![1.0]);
        let mut other = sum.clone();
        other.insert(
            "extra",
            LayerWeights::new(Tensor::zeros(vec![1]).unwrap(), Tensor::zeros(vec![1]).unwrap()),
        );

        let err = sum.add_assign(&other).unwrap_err();
        assert_eq!(
            err,
            ShapeError::MissingLayer {
                layer: "extra".into(),
                side: "local"
            }
        );

        let err = other.add_assign(&sum).unwrap_err();
        assert!(matches!(err, ShapeError::MissingLayer { side: "incoming", .. }));
    }

    #[test]
    fn test_wire_format_layout() {
        let set = dense(vec![0.5, -1.25], vec![2.0]);
        let json: serde_json::Value = serde_json::to_value(&set).unwrap();

        assert_eq!(json["dense"]["values"][0], serde_json::json!([0.5, -1.25]));
        assert_eq!(json["dense"]["values"][1], serde_json::json!([2.0]));
        assert_eq!(json["dense"]["shapes"][0], serde_json::json!([2, 1]));
        assert_eq!(json["dense"]["shapes"][1], serde_json::json!([1]));
    }

    #[test]
    fn test_wire_decode_rejects_inconsistent_shape() {
        let json = r#"{"dense": {"values": [[1.0, 2.0], [0.0]], "shapes": [[3, 1], [1]]}}"#;
        assert!(serde_json::from_str::<ParameterSet>(json).is_err());
    }

    #[test]
    fn test_wire_decode_rejects_overflowing_shape() {
        let json = r#"{"dense": {"values": [[], [0.0]], "shapes": [[4294967296, 4294967296], [1]]}}"#;
        let err = serde_json::from_str::<ParameterSet>(json).unwrap_err();
        assert!(err.to_string().contains("overflows"), "got {}", err);

        assert!(matches!(
            Tensor::new(Vec::new(), vec![usize::MAX, 2]),
            Err(ShapeError::Overflow { .. })
        ));
        assert!(Tensor::zeros(vec![usize::MAX, usize::MAX]).is_err());
    }

    #[test]
    fn test_wire_roundtrip_is_bit_exact() {
        let awkward = vec![0.1 + 0.2, 1.0 / 3.0, f64::MIN_POSITIVE, 1e308, -7.000000000000001];
        let set = dense(awkward.clone(), vec![std::f64::consts::PI]);

        let bytes = serde_json::to_vec(&set).unwrap();
        let back: ParameterSet = serde_json::from_slice(&bytes).unwrap();

        let layer = back.get("dense").unwrap();
        for (a, b) in layer.kernel.values().iter().zip(&awkward) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(layer.bias.values()[0].to_bits(), std::f64::consts::PI.to_bits());
    }

    #[test]
    fn test_is_finite() {
        let mut set = dense(vec![1.0], vec![1.0]);
        assert!(set.is_finite());
        set.divide_by(0.0);
        assert!(!set.is_finite());
    }
}
