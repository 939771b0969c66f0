//! Retinal fundus screening for diabetic retinopathy
//!
//! Classifies a fundus photograph into one of five severity grades and
//! explains the decision with a Grad-CAM heatmap over the resized input.
//!
//! The work is split across crates:
//! - [`common`]: error taxonomy, typed image entities, configuration
//! - [`preprocessing`]: resize, CLAHE on lightness, normalization
//! - [`classifier`]: backbone + pooled linear head, softmax prediction
//! - [`explainability`]: capture context, Grad-CAM engine, heatmap overlay
//! - [`screening`]: upload validation/decoding/encoding and the request pipeline
//!
//! # Example
//! ```no_run
//! use retina_screening::{ScreeningConfig, ScreeningService};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ScreeningService::new(ScreeningConfig::from_env()?)?;
//! let bytes = std::fs::read("fundus.jpg")?;
//! let report = service.screen(&bytes, "fundus.jpg")?;
//! println!("{} ({:.1}%)", report.severity_label, report.confidence_score * 100.0);
//! # Ok(())
//! # }
//! ```

pub use retina_classifier as classifier;
pub use retina_common as common;
pub use retina_explainability as explainability;
pub use retina_preprocessing as preprocessing;
pub use retina_screening_core as screening;

pub use retina_classifier::SeverityClassifier;
pub use retina_common::{
    BlendedImage, DecodedImage, ErrorCategory, ExplanationPolicy, Failure, ModelTensor,
    PredictionResult, ScreeningConfig, ScreeningError, VisualizationImage,
};
pub use retina_explainability::{explain, generate_cam, GradCam, SaliencyMap};
pub use retina_preprocessing::Preprocessor;
pub use retina_screening_core::{HealthReport, ScreeningReport, ScreeningService};
