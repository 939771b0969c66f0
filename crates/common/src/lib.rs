/// Common types and utilities for retinal screening
use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod config;

pub use config::{ConfigError, ExplanationPolicy, ScreeningConfig};

/// Screening errors
///
/// Every component error folds into one of these variants at the request
/// boundary. None of them is process-fatal.
#[derive(Debug, Error)]
pub enum ScreeningError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Explainability wiring error: {0}")]
    Hook(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ScreeningError {
    /// Category reported to the caller
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ScreeningError::Validation(_) => ErrorCategory::Validation,
            ScreeningError::Decode(_) => ErrorCategory::Decode,
            ScreeningError::Inference(_) => ErrorCategory::Inference,
            ScreeningError::Hook(_) => ErrorCategory::Hook,
            ScreeningError::Encode(_) => ErrorCategory::Encode,
            ScreeningError::Config(_) | ScreeningError::IoError(_) => ErrorCategory::Internal,
        }
    }

    /// Whether asking the user for a different file can fix the failure
    #[must_use]
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            ScreeningError::Validation(_) | ScreeningError::Decode(_)
        )
    }

    /// Translate into the single user-facing failure shape
    #[must_use]
    pub fn to_failure(&self) -> Failure {
        Failure {
            category: self.category(),
            message: self.to_string(),
        }
    }
}

impl From<image::ImageError> for ScreeningError {
    fn from(err: image::ImageError) -> Self {
        ScreeningError::Decode(err.to_string())
    }
}

/// Result type for screening operations
pub type Result<T> = std::result::Result<T, ScreeningError>;

/// Failure category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Decode,
    Inference,
    Hook,
    Encode,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Decode => "decode",
            ErrorCategory::Inference => "inference",
            ErrorCategory::Hook => "hook",
            ErrorCategory::Encode => "encode",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// User-facing failure with a category and message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub category: ErrorCategory,
    pub message: String,
}

/// Decoded upload, 3 channels in RGB order
///
/// The channel order is carried by the `Rgb<u8>` pixel type, so a BGR buffer
/// cannot be passed where this is expected.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage(RgbImage);

impl DecodedImage {
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self(image)
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    #[must_use]
    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }

    #[must_use]
    pub fn into_rgb(self) -> RgbImage {
        self.0
    }
}

/// Resized but otherwise untouched RGB image used as the overlay base
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationImage(RgbImage);

impl VisualizationImage {
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self(image)
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    #[must_use]
    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }

    #[must_use]
    pub fn into_rgb(self) -> RgbImage {
        self.0
    }
}

/// Colorized saliency composited over a [`VisualizationImage`], RGB order
#[derive(Debug, Clone, PartialEq)]
pub struct BlendedImage(RgbImage);

impl BlendedImage {
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self(image)
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    #[must_use]
    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }

    #[must_use]
    pub fn into_rgb(self) -> RgbImage {
        self.0
    }
}

/// Channel-first (3 x H x W) normalized model input
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTensor(Array3<f32>);

impl ModelTensor {
    /// Wrap a CHW array
    ///
    /// # Errors
    /// Returns an inference error if the array does not have exactly 3 channels
    pub fn new(data: Array3<f32>) -> Result<Self> {
        if data.dim().0 != 3 {
            return Err(ScreeningError::Inference(format!(
                "model tensor must have 3 channels, got shape {:?}",
                data.shape()
            )));
        }
        Ok(Self(data))
    }

    /// (channels, height, width)
    #[must_use]
    pub fn shape(&self) -> (usize, usize, usize) {
        self.0.dim()
    }

    #[must_use]
    pub fn data(&self) -> &Array3<f32> {
        &self.0
    }

    #[must_use]
    pub fn into_data(self) -> Array3<f32> {
        self.0
    }
}

/// Outcome of one forward pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub class_index: usize,
    pub severity_label: String,
    /// Probability of the selected class (0-1)
    pub confidence_score: f32,
    /// Softmax over all severity classes, in class-list order
    pub probabilities: Vec<f32>,
}

impl PredictionResult {
    /// Build from a probability vector by taking the argmax
    ///
    /// # Errors
    /// Returns an inference error if the vector is empty or its length does not
    /// match the class list
    pub fn from_probabilities(probabilities: Vec<f32>, classes: &[String]) -> Result<Self> {
        if probabilities.is_empty() || probabilities.len() != classes.len() {
            return Err(ScreeningError::Inference(format!(
                "expected {} class probabilities, got {}",
                classes.len(),
                probabilities.len()
            )));
        }

        let (class_index, confidence_score) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });

        Ok(Self {
            class_index,
            severity_label: classes[class_index].clone(),
            confidence_score,
            probabilities,
        })
    }
}
