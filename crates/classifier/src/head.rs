//! Global average pooling followed by a fully connected layer
//!
//! This is the replaced final layer of the backbone network: one score per
//! severity class. Because the head is linear in the pooled features, the
//! gradient of any class score with respect to the target-layer activation is
//! exact and cheap: `d score_c / d A[k, i, j] = W[c, k] / (H' * W')`.

use ndarray::{Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::ClassifierError;

/// Serialized head weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearHeadSpec {
    /// (num_classes, in_features), row-major
    pub weight: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct LinearHead {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearHead {
    /// # Errors
    /// Returns error if the bias length does not match the class count
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, ClassifierError> {
        if weight.nrows() != bias.len() || weight.nrows() == 0 || weight.ncols() == 0 {
            return Err(ClassifierError::InvalidWeights(format!(
                "head weight {:?} does not match bias of {}",
                weight.dim(),
                bias.len()
            )));
        }
        Ok(Self { weight, bias })
    }

    /// # Errors
    /// Returns error if the rows are ragged or disagree with the bias
    pub fn from_spec(spec: LinearHeadSpec) -> Result<Self, ClassifierError> {
        let rows = spec.weight.len();
        let cols = spec.weight.first().map_or(0, Vec::len);
        if spec.weight.iter().any(|row| row.len() != cols) {
            return Err(ClassifierError::InvalidWeights(
                "head weight rows have different lengths".into(),
            ));
        }
        let flat: Vec<f32> = spec.weight.into_iter().flatten().collect();
        let weight = Array2::from_shape_vec((rows, cols), flat)
            .map_err(|e| ClassifierError::InvalidWeights(format!("head weight: {e}")))?;
        Self::new(weight, Array1::from(spec.bias))
    }

    /// Load weights from a JSON file
    ///
    /// # Errors
    /// Returns error if the file is missing, unparsable or inconsistent
    pub fn from_json_file(path: &Path) -> Result<Self, ClassifierError> {
        info!("Loading classifier head from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::ModelLoad(format!("failed to read {}: {e}", path.display()))
        })?;
        let spec: LinearHeadSpec = serde_json::from_str(&contents)
            .map_err(|e| ClassifierError::InvalidWeights(format!("{}: {e}", path.display())))?;
        Self::from_spec(spec)
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.weight.nrows()
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    fn check(&self, activation: &Array3<f32>) -> Result<(), ClassifierError> {
        let (c, h, w) = activation.dim();
        if c != self.in_features() || h == 0 || w == 0 {
            return Err(ClassifierError::Inference(format!(
                "head expects ({}, H, W) activations, got {:?}",
                self.in_features(),
                activation.dim()
            )));
        }
        Ok(())
    }

    /// Pool and project: one logit per class
    ///
    /// # Errors
    /// Returns error if the activation channel count does not match the head
    pub fn forward(&self, activation: &Array3<f32>) -> Result<Array1<f32>, ClassifierError> {
        self.check(activation)?;
        let (_, h, w) = activation.dim();
        let pooled = activation.sum_axis(Axis(2)).sum_axis(Axis(1)) / (h * w) as f32;
        Ok(self.weight.dot(&pooled) + &self.bias)
    }

    /// Gradient of one class score with respect to the activation
    ///
    /// # Errors
    /// Returns error if the class is out of range or the activation shape is wrong
    pub fn backward(
        &self,
        activation: &Array3<f32>,
        target_class: usize,
    ) -> Result<Array3<f32>, ClassifierError> {
        self.check(activation)?;
        if target_class >= self.num_classes() {
            return Err(ClassifierError::InvalidTargetClass {
                class: target_class,
                num_classes: self.num_classes(),
            });
        }
        let (c, h, w) = activation.dim();
        let scale = 1.0 / (h * w) as f32;
        let row = self.weight.row(target_class);
        Ok(Array3::from_shape_fn((c, h, w), |(k, _, _)| row[k] * scale))
    }
}
