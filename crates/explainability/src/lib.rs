//! Grad-CAM explanations for the severity classifier
//!
//! Produces a class-discriminative saliency map at the classifier's target
//! layer and renders it as a jet heatmap blended over the resized input.
//!
//! # Features
//! - Typestate engine ([`GradCam`]) with a per-invocation [`CaptureContext`]
//! - Captures are tagged with their forward pass; mixing passes is a [`HookError`]
//! - Degenerate (constant) maps normalize to all zeros and render as cold
//!
//! # Example
//! ```no_run
//! use retina_explainability::explain;
//! # fn demo(
//! #     classifier: &retina_classifier::SeverityClassifier,
//! #     tensor: &retina_common::ModelTensor,
//! #     base: &retina_common::VisualizationImage,
//! # ) -> Result<(), retina_explainability::ExplainError> {
//! let explanation = explain(classifier, tensor, base, None, 0.5)?;
//! println!("explained class {}", explanation.target_class);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod colormap;
pub mod gradcam;
pub mod overlay;
pub mod saliency;

use ndarray::Array1;
use retina_classifier::{ClassifierError, SeverityClassifier};
use retina_common::{BlendedImage, ModelTensor, ScreeningError, VisualizationImage};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

pub use capture::CaptureContext;
pub use colormap::{jet, JetPalette};
pub use gradcam::{Backpropagated, Computed, Forwarded, GradCam, Hooked, Idle};
pub use overlay::{colorize, overlay};
pub use saliency::{grad_cam, SaliencyMap};

/// Capture wiring violations
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Capture still armed on {0}; release the previous pass first")]
    StillArmed(String),

    #[error("Capture context is not armed")]
    NotArmed,

    #[error("No {0} captured")]
    NotCaptured(&'static str),

    #[error("{0} already captured for this pass")]
    AlreadyCaptured(&'static str),

    #[error("Capture armed on {armed} but received output of {captured}")]
    LayerMismatch { armed: String, captured: String },

    #[error("Gradient from pass {gradient} paired with activation from pass {activation}")]
    PassMismatch { activation: u64, gradient: u64 },

    #[error("Activation {activation:?} and gradient {gradient:?} shapes differ")]
    ShapeMismatch {
        activation: (usize, usize, usize),
        gradient: (usize, usize, usize),
    },
}

/// Errors raised while explaining a prediction
#[derive(Debug, Error)]
pub enum ExplainError {
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

impl From<ExplainError> for ScreeningError {
    fn from(err: ExplainError) -> Self {
        match err {
            ExplainError::Hook(e) => ScreeningError::Hook(e.to_string()),
            ExplainError::Classifier(e) => e.into(),
        }
    }
}

/// Saliency map at the target layer's resolution
///
/// Runs one full engine cycle. Upsample the result with
/// [`SaliencyMap::upsample`] or render it with [`overlay`].
///
/// # Errors
/// Returns error on inference failure, out-of-range target class or a capture
/// pairing violation
pub fn generate_cam(
    classifier: &SeverityClassifier,
    tensor: &ModelTensor,
    target_class: Option<usize>,
) -> Result<Computed, ExplainError> {
    GradCam::new(classifier)
        .hook()?
        .forward(tensor, target_class)?
        .backward()?
        .compute()
}

/// Saliency plus its rendering over the visualization image
///
/// `logits` come from the engine's own forward pass, so the prediction can be
/// scored from them without running the backbone again.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub target_class: usize,
    pub predicted_class: usize,
    pub logits: Array1<f32>,
    pub saliency: SaliencyMap,
    pub blended: BlendedImage,
}

/// Generate the Grad-CAM map and blend it over `base`
///
/// # Errors
/// See [`generate_cam`]
pub fn explain(
    classifier: &SeverityClassifier,
    tensor: &ModelTensor,
    base: &VisualizationImage,
    target_class: Option<usize>,
    alpha: f32,
) -> Result<Explanation, ExplainError> {
    let start = Instant::now();
    let computed = generate_cam(classifier, tensor, target_class)?;
    let blended = overlay(&computed.saliency, base, alpha);

    debug!(
        "Explained class {} ({}x{} map, degenerate: {}) in {:.3}s",
        computed.target_class,
        computed.saliency.dim().0,
        computed.saliency.dim().1,
        computed.saliency.is_degenerate(),
        start.elapsed().as_secs_f64()
    );

    Ok(Explanation {
        target_class: computed.target_class,
        predicted_class: computed.predicted_class,
        logits: computed.logits,
        saliency: computed.saliency,
        blended,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use ndarray::{array, Array3, Array4};
    use retina_classifier::{ConvBackbone, ConvLayer, LinearHead, SeverityClassifier};
    use retina_common::ModelTensor;

    pub fn tiny_classifier() -> SeverityClassifier {
        let layer = ConvLayer::new(
            Array4::from_shape_fn((2, 3, 3, 3), |(o, c, y, x)| {
                ((o * 13 + c * 5 + y * 3 + x) % 7) as f32 * 0.1 - 0.25
            }),
            array![0.05, 0.1],
            2,
            1,
        )
        .unwrap();
        let backbone = ConvBackbone::new("block1", vec![layer]).unwrap();
        let head = LinearHead::new(
            array![[1.0, -0.5], [-0.5, 1.0], [0.3, 0.3]],
            array![0.0, 0.1, -0.1],
        )
        .unwrap();
        let classes = vec!["a".into(), "b".into(), "c".into()];
        SeverityClassifier::new(Box::new(backbone), head, classes, 8).unwrap()
    }

    pub fn tiny_input() -> ModelTensor {
        ModelTensor::new(Array3::from_shape_fn((3, 8, 8), |(c, y, x)| {
            ((c * 7 + y * 3 + x * 5) % 11) as f32 / 5.0 - 1.0
        }))
        .unwrap()
    }
}
