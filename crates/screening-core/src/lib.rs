//! Retinal screening core
//!
//! Ties the stages together for one upload:
//! validate -> decode -> preprocess / visualize -> predict -> Grad-CAM ->
//! blend -> JPEG. The [`ScreeningService`] is built once (model weights load
//! at construction) and shared read-only; every request gets its own
//! explanation engine.

pub mod image_io;
pub mod pipeline;

pub use image_io::{decode, encode, has_allowed_extension, validate, ImageIoError};
pub use pipeline::{HealthReport, ScreeningReport, ScreeningService};
pub use retina_common::{
    ErrorCategory, ExplanationPolicy, Failure, Result, ScreeningConfig, ScreeningError,
};
