//! Diabetic-retinopathy severity classifier
//!
//! Wraps a frozen convolutional backbone (ONNX export of ResNet-50 truncated
//! after `layer4`, or a native ndarray stack) and a pooled linear head with one
//! output per severity class.
//!
//! # Features
//! - `predict`: softmax over the head logits, argmax class and confidence
//! - `forward` / `backward`: the explicit pass pair Grad-CAM needs, returning the
//!   target-layer activation and the gradient of one class score with respect
//!   to it, both tagged with the pass that produced them
//! - Weights load once; the classifier is `Send + Sync` and shared through `Arc`
//!
//! # Example
//! ```no_run
//! use retina_classifier::SeverityClassifier;
//! use retina_common::ScreeningConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScreeningConfig::default();
//! let classifier = SeverityClassifier::load(&config)?;
//! # let tensor: retina_common::ModelTensor = unimplemented!();
//! let prediction = classifier.predict(&tensor)?;
//! println!("{} ({:.1}%)", prediction.severity_label, prediction.confidence_score * 100.0);
//! # Ok(())
//! # }
//! ```

pub mod backbone;
pub mod head;
pub mod onnx_utils;

use ndarray::{Array1, Array3};
use retina_common::{ModelTensor, PredictionResult, ScreeningConfig, ScreeningError};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

pub use backbone::{Backbone, ConvBackbone, ConvBackboneSpec, ConvLayer, ConvLayerSpec, OnnxBackbone};
pub use head::{LinearHead, LinearHeadSpec};
pub use onnx_utils::OnnxError;

/// Name of the ResNet-50 block used as the explanation target
pub const RESNET_TARGET_LAYER: &str = "layer4";

/// Errors that can occur during classification
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Invalid weights: {0}")]
    InvalidWeights(String),

    #[error("Input shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("Target class {class} out of range for {num_classes} classes")]
    InvalidTargetClass { class: usize, num_classes: usize },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("ONNX error: {0}")]
    Onnx(#[from] OnnxError),

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::Error),
}

impl From<ClassifierError> for ScreeningError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::ModelLoad(_)
            | ClassifierError::InvalidWeights(_)
            | ClassifierError::Onnx(_) => ScreeningError::Config(err.to_string()),
            _ => ScreeningError::Inference(err.to_string()),
        }
    }
}

/// Identifier of one forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(u64);

impl PassId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Target-layer output captured during one forward pass, (C, H', W')
#[derive(Debug, Clone)]
pub struct ActivationMap {
    pass: PassId,
    layer: String,
    data: Array3<f32>,
}

impl ActivationMap {
    #[must_use]
    pub fn pass(&self) -> PassId {
        self.pass
    }

    #[must_use]
    pub fn layer(&self) -> &str {
        &self.layer
    }

    #[must_use]
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }
}

/// Gradient of one class score at the target layer, same shape as its activation
#[derive(Debug, Clone)]
pub struct GradientMap {
    pass: PassId,
    target_class: usize,
    data: Array3<f32>,
}

impl GradientMap {
    #[must_use]
    pub fn pass(&self) -> PassId {
        self.pass
    }

    #[must_use]
    pub fn target_class(&self) -> usize {
        self.target_class
    }

    #[must_use]
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }
}

/// Result of [`SeverityClassifier::forward`]: logits plus the target-layer capture
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub logits: Array1<f32>,
    pub activation: ActivationMap,
}

impl ForwardPass {
    /// Index of the highest logit
    #[must_use]
    pub fn argmax(&self) -> usize {
        argmax(&self.logits)
    }
}

/// Frozen classifier: backbone + pooled linear head + ordered class labels
pub struct SeverityClassifier {
    backbone: Box<dyn Backbone>,
    head: LinearHead,
    classes: Vec<String>,
    input_size: usize,
    next_pass: AtomicU64,
}

impl SeverityClassifier {
    /// Assemble from parts
    ///
    /// # Errors
    /// Returns error if the head, backbone and class list disagree
    pub fn new(
        backbone: Box<dyn Backbone>,
        head: LinearHead,
        classes: Vec<String>,
        input_size: u32,
    ) -> Result<Self, ClassifierError> {
        if head.num_classes() != classes.len() {
            return Err(ClassifierError::InvalidWeights(format!(
                "head emits {} scores for {} severity classes",
                head.num_classes(),
                classes.len()
            )));
        }
        if let Some(channels) = backbone.out_channels() {
            if channels != head.in_features() {
                return Err(ClassifierError::InvalidWeights(format!(
                    "backbone emits {} channels, head expects {}",
                    channels,
                    head.in_features()
                )));
            }
        }

        Ok(Self {
            backbone,
            head,
            classes,
            input_size: input_size as usize,
            next_pass: AtomicU64::new(1),
        })
    }

    /// Load backbone and head named by the configuration
    ///
    /// `.onnx` model paths use ONNX Runtime, `.json` paths the native backbone.
    ///
    /// # Errors
    /// Returns error if either weight file is missing or inconsistent
    pub fn load(config: &ScreeningConfig) -> Result<Self, ClassifierError> {
        let backbone = load_backbone(&config.model_path, config.threads)?;
        let head = LinearHead::from_json_file(&config.head_path)?;

        let classifier = Self::new(
            backbone,
            head,
            config.severity_classes.clone(),
            config.input_size,
        )?;
        info!(
            "Severity classifier ready ({} backbone, target layer {}, {} classes)",
            classifier.backbone.name(),
            classifier.target_layer(),
            classifier.num_classes()
        );
        Ok(classifier)
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Forward passes run so far
    #[must_use]
    pub fn forward_passes(&self) -> u64 {
        self.next_pass.load(Ordering::Relaxed) - 1
    }

    #[must_use]
    pub fn target_layer(&self) -> &str {
        self.backbone.target_layer()
    }

    fn check_input(&self, tensor: &ModelTensor) -> Result<(), ClassifierError> {
        let expected = (3, self.input_size, self.input_size);
        if tensor.shape() != expected {
            return Err(ClassifierError::ShapeMismatch {
                expected,
                actual: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Forward pass keeping the target-layer activation
    ///
    /// # Errors
    /// Returns error on input shape mismatch or backbone failure
    pub fn forward(&self, tensor: &ModelTensor) -> Result<ForwardPass, ClassifierError> {
        self.check_input(tensor)?;

        let features = self.backbone.extract(tensor.data())?;
        let logits = self.head.forward(&features)?;
        let pass = PassId(self.next_pass.fetch_add(1, Ordering::Relaxed));

        debug!(
            "Forward pass {} produced {:?} activation at {}",
            pass.0,
            features.dim(),
            self.target_layer()
        );

        Ok(ForwardPass {
            logits,
            activation: ActivationMap {
                pass,
                layer: self.target_layer().to_string(),
                data: features,
            },
        })
    }

    /// Backpropagate the score of `target_class` alone down to the target layer
    ///
    /// # Errors
    /// Returns error if the class index is out of range
    pub fn backward(
        &self,
        activation: &ActivationMap,
        target_class: usize,
    ) -> Result<GradientMap, ClassifierError> {
        let data = self.head.backward(&activation.data, target_class)?;
        Ok(GradientMap {
            pass: activation.pass,
            target_class,
            data,
        })
    }

    /// Classify without keeping any capture
    ///
    /// # Errors
    /// Returns error on input shape mismatch or backbone failure
    pub fn predict(&self, tensor: &ModelTensor) -> Result<PredictionResult, ClassifierError> {
        let pass = self.forward(tensor)?;
        self.score(&pass.logits)
    }

    /// Softmax and label the logits of a pass that already ran
    ///
    /// # Errors
    /// Returns error if the logits do not match the class list
    pub fn score(&self, logits: &Array1<f32>) -> Result<PredictionResult, ClassifierError> {
        let probabilities = softmax(logits);
        let prediction = PredictionResult::from_probabilities(probabilities.to_vec(), &self.classes)
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        debug!(
            "Predicted {} (class {}, confidence {:.3})",
            prediction.severity_label, prediction.class_index, prediction.confidence_score
        );
        Ok(prediction)
    }
}

fn load_backbone(path: &Path, threads: Option<usize>) -> Result<Box<dyn Backbone>, ClassifierError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "onnx" => Ok(Box::new(OnnxBackbone::new(path, RESNET_TARGET_LAYER, threads)?)),
        "json" => Ok(Box::new(ConvBackbone::from_json_file(path)?)),
        other => Err(ClassifierError::ModelLoad(format!(
            "unsupported model format '{other}' for {}",
            path.display()
        ))),
    }
}

/// Numerically stable softmax
#[must_use]
pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

fn argmax(values: &Array1<f32>) -> usize {
    values
        .indexed_iter()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array4};

    fn classes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class-{i}")).collect()
    }

    fn tiny_classifier() -> SeverityClassifier {
        let layer = ConvLayer::new(
            Array4::from_shape_fn((2, 3, 3, 3), |(o, c, y, x)| {
                ((o * 31 + c * 7 + y * 3 + x) % 5) as f32 * 0.1 - 0.2
            }),
            array![0.1, 0.05],
            2,
            1,
        )
        .unwrap();
        let backbone = ConvBackbone::new("block1", vec![layer]).unwrap();
        let head = LinearHead::new(array![[1.0, -1.0], [0.5, 0.5], [-1.0, 2.0]], array![0.0, 0.0, 0.1]).unwrap();
        SeverityClassifier::new(Box::new(backbone), head, classes(3), 8).unwrap()
    }

    fn tensor(size: usize) -> ModelTensor {
        ModelTensor::new(Array3::from_shape_fn((3, size, size), |(c, y, x)| {
            ((c + 2 * y + 3 * x) % 7) as f32 * 0.3 - 1.0
        }))
        .unwrap()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&array![1.0, 2.0, 3.0, -50.0, 1000.0]);
        assert!((probs.sum() - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(argmax(&probs), 4);
    }

    #[test]
    fn test_predict_confidence_bounds() {
        let classifier = tiny_classifier();
        let prediction = classifier.predict(&tensor(8)).unwrap();
        assert!(prediction.class_index < 3);
        assert!((0.0..=1.0).contains(&prediction.confidence_score));
        let total: f32 = prediction.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(
            prediction.confidence_score,
            prediction.probabilities[prediction.class_index]
        );
    }

    #[test]
    fn test_forward_rejects_wrong_shape() {
        let err = tiny_classifier().forward(&tensor(16)).unwrap_err();
        assert!(matches!(err, ClassifierError::ShapeMismatch { .. }));
        assert!(matches!(ScreeningError::from(err), ScreeningError::Inference(_)));
    }

    #[test]
    fn test_passes_get_distinct_ids() {
        let classifier = tiny_classifier();
        let a = classifier.forward(&tensor(8)).unwrap();
        let b = classifier.forward(&tensor(8)).unwrap();
        assert_ne!(a.activation.pass(), b.activation.pass());
        assert_eq!(a.activation.layer(), "block1");
    }

    #[test]
    fn test_score_matches_predict_on_same_pass() {
        let classifier = tiny_classifier();
        let pass = classifier.forward(&tensor(8)).unwrap();
        let scored = classifier.score(&pass.logits).unwrap();
        let predicted = classifier.predict(&tensor(8)).unwrap();
        assert_eq!(scored, predicted);
        assert_eq!(scored.class_index, pass.argmax());
    }

    #[test]
    fn test_forward_passes_counts_successful_passes() {
        let classifier = tiny_classifier();
        assert_eq!(classifier.forward_passes(), 0);
        classifier.forward(&tensor(8)).unwrap();
        classifier.predict(&tensor(8)).unwrap();
        assert!(classifier.forward(&tensor(16)).is_err());
        assert_eq!(classifier.forward_passes(), 2);
    }

    #[test]
    fn test_backward_is_tagged_with_pass() {
        let classifier = tiny_classifier();
        let pass = classifier.forward(&tensor(8)).unwrap();
        let grad = classifier.backward(&pass.activation, 1).unwrap();
        assert_eq!(grad.pass(), pass.activation.pass());
        assert_eq!(grad.target_class(), 1);
        assert_eq!(grad.data().dim(), pass.activation.data().dim());
    }

    #[test]
    fn test_head_class_count_must_match_labels() {
        let layer = ConvLayer::new(Array4::zeros((2, 3, 1, 1)), array![0.0, 0.0], 1, 0).unwrap();
        let backbone = ConvBackbone::new("block1", vec![layer]).unwrap();
        let head = LinearHead::new(array![[1.0, 0.0]], array![0.0]).unwrap();
        let result = SeverityClassifier::new(Box::new(backbone), head, classes(5), 8);
        assert!(matches!(result, Err(ClassifierError::InvalidWeights(_))));
    }

    #[test]
    fn test_unsupported_model_extension() {
        let result = load_backbone(Path::new("weights.pth"), None);
        assert!(matches!(result, Err(ClassifierError::ModelLoad(_))));
    }
}
