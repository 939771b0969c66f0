//! Request pipeline: bytes in, severity + heatmap out

use retina_classifier::SeverityClassifier;
use retina_common::{ExplanationPolicy, Failure, Result, ScreeningConfig, ScreeningError};
use retina_explainability::explain;
use retina_preprocessing::Preprocessor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::image_io;

/// Outcome of screening one upload
#[derive(Debug, Clone, Serialize)]
pub struct ScreeningReport {
    pub severity_label: String,
    pub class_index: usize,
    /// Probability of the predicted class (0-1)
    pub confidence_score: f32,
    /// Softmax over all severity classes, in class-list order
    pub probabilities: Vec<f32>,
    /// Confidence fell below the configured threshold
    pub low_confidence: bool,
    /// Class the heatmap explains, if one was produced
    pub explained_class: Option<usize>,
    /// JPEG of the heatmap blended over the resized upload
    #[serde(skip)]
    pub heatmap_jpeg: Option<Vec<u8>>,
    /// JPEG of the resized upload
    #[serde(skip)]
    pub original_jpeg: Option<Vec<u8>>,
    /// Why the heatmap is missing under `ExplanationPolicy::ClassificationOnly`
    pub explanation_failure: Option<Failure>,
    pub processing_time_ms: u64,
}

/// Liveness summary for the loaded service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub model_loaded: bool,
    pub severity_classes: Vec<String>,
    pub input_size: u32,
}

impl HealthReport {
    /// Report for a process whose model could not be loaded
    #[must_use]
    pub fn unavailable(config: &ScreeningConfig) -> Self {
        Self {
            status: "unavailable".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_loaded: false,
            severity_classes: config.severity_classes.clone(),
            input_size: config.input_size,
        }
    }
}

/// Read-only screening service, built once and shared across requests
///
/// Cloning is cheap: the classifier is behind an `Arc`.
#[derive(Clone)]
pub struct ScreeningService {
    config: ScreeningConfig,
    preprocessor: Preprocessor,
    classifier: Arc<SeverityClassifier>,
}

impl ScreeningService {
    /// Validate the configuration and load the model weights
    ///
    /// # Errors
    /// Returns a configuration error if validation or model loading fails
    pub fn new(config: ScreeningConfig) -> Result<Self> {
        config.validate()?;
        let start = Instant::now();
        let classifier = SeverityClassifier::load(&config)?;
        info!(
            "Screening service loaded in {:.3}s",
            start.elapsed().as_secs_f64()
        );
        Self::with_classifier(config, Arc::new(classifier))
    }

    /// Use an already loaded classifier
    ///
    /// # Errors
    /// Returns a configuration error if the classifier disagrees with the
    /// configured input size or class list
    pub fn with_classifier(
        config: ScreeningConfig,
        classifier: Arc<SeverityClassifier>,
    ) -> Result<Self> {
        config.validate()?;
        if classifier.input_size() != config.input_size as usize {
            return Err(ScreeningError::Config(format!(
                "classifier expects {0}x{0} input, config says {1}x{1}",
                classifier.input_size(),
                config.input_size
            )));
        }
        if classifier.classes() != config.severity_classes.as_slice() {
            return Err(ScreeningError::Config(
                "classifier labels differ from severity_classes".into(),
            ));
        }

        Ok(Self {
            preprocessor: Preprocessor::new(&config),
            config,
            classifier,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ScreeningConfig {
        &self.config
    }

    #[must_use]
    pub fn classifier(&self) -> &Arc<SeverityClassifier> {
        &self.classifier
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_loaded: true,
            severity_classes: self.classifier.classes().to_vec(),
            input_size: self.config.input_size,
        }
    }

    /// Screen one upload, explaining the predicted class
    ///
    /// # Errors
    /// Validation, decode, inference, hook or encode errors; see
    /// [`ExplanationPolicy`] for which explanation failures surface here
    pub fn screen(&self, bytes: &[u8], filename: &str) -> Result<ScreeningReport> {
        self.screen_with_target(bytes, filename, None)
    }

    /// Screen one upload, explaining `target_class` (or the prediction if `None`)
    ///
    /// # Errors
    /// See [`ScreeningService::screen`]
    pub fn screen_with_target(
        &self,
        bytes: &[u8],
        filename: &str,
        target_class: Option<usize>,
    ) -> Result<ScreeningReport> {
        let start = Instant::now();

        if let Some(class) = target_class {
            if class >= self.classifier.num_classes() {
                return Err(ScreeningError::Inference(format!(
                    "target class {class} out of range for {} classes",
                    self.classifier.num_classes()
                )));
            }
        }
        image_io::check_size(bytes, self.config.max_image_bytes)?;
        if !image_io::has_allowed_extension(filename, &self.config.allowed_extensions) {
            return Err(ScreeningError::Validation(format!(
                "{filename}: extension must be one of {:?}",
                self.config.allowed_extensions
            )));
        }
        let decoded = image_io::decode(bytes)?;

        let tensor = self.preprocessor.preprocess(&decoded)?;
        let visual = self.preprocessor.visualize(&decoded)?;

        // The engine's forward pass doubles as the classification pass
        let (prediction, heatmap) = match explain(
            &self.classifier,
            &tensor,
            &visual,
            target_class,
            self.config.overlay_alpha,
        ) {
            Ok(explanation) => {
                let prediction = self.classifier.score(&explanation.logits)?;
                let heatmap = image_io::encode(&explanation.blended, self.config.jpeg_quality)
                    .map(|jpeg| (explanation.target_class, jpeg))
                    .map_err(ScreeningError::from);
                (prediction, heatmap)
            }
            Err(err) => match self.config.explanation_policy {
                ExplanationPolicy::FailRequest => return Err(err.into()),
                ExplanationPolicy::ClassificationOnly => {
                    (self.classifier.predict(&tensor)?, Err(err.into()))
                }
            },
        };

        let low_confidence = prediction.confidence_score < self.config.confidence_threshold;
        if low_confidence {
            warn!(
                "{}: low confidence {:.3} for {}",
                filename, prediction.confidence_score, prediction.severity_label
            );
        }

        let (explained_class, heatmap_jpeg, explanation_failure) =
            apply_policy(self.config.explanation_policy, heatmap, filename)?;

        let original_jpeg = if self.config.include_original {
            Some(image_io::encode_jpeg(visual.as_rgb(), self.config.jpeg_quality)?)
        } else {
            None
        };

        let elapsed = start.elapsed();
        debug!("{}: probabilities {:?}", filename, prediction.probabilities);
        info!(
            "Screened {} as {} ({:.1}%) in {:.3}s",
            filename,
            prediction.severity_label,
            prediction.confidence_score * 100.0,
            elapsed.as_secs_f64()
        );

        Ok(ScreeningReport {
            severity_label: prediction.severity_label,
            class_index: prediction.class_index,
            confidence_score: prediction.confidence_score,
            probabilities: prediction.probabilities,
            low_confidence,
            explained_class,
            heatmap_jpeg,
            original_jpeg,
            explanation_failure,
            processing_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

type HeatmapOutcome = (Option<usize>, Option<Vec<u8>>, Option<Failure>);

/// Resolve an explanation result against the configured policy
fn apply_policy(
    policy: ExplanationPolicy,
    heatmap: Result<(usize, Vec<u8>)>,
    filename: &str,
) -> Result<HeatmapOutcome> {
    match heatmap {
        Ok((class, jpeg)) => Ok((Some(class), Some(jpeg), None)),
        Err(err) => match policy {
            ExplanationPolicy::FailRequest => Err(err),
            ExplanationPolicy::ClassificationOnly => {
                warn!("{}: returning classification without heatmap: {}", filename, err);
                Ok((None, None, Some(err.to_failure())))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retina_common::ErrorCategory;

    #[test]
    fn test_fail_request_policy_propagates() {
        let err = apply_policy(
            ExplanationPolicy::FailRequest,
            Err(ScreeningError::Hook("pass mismatch".into())),
            "a.jpg",
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Hook);
    }

    #[test]
    fn test_classification_only_policy_records_failure() {
        let (class, jpeg, failure) = apply_policy(
            ExplanationPolicy::ClassificationOnly,
            Err(ScreeningError::Encode("zero-sized".into())),
            "a.jpg",
        )
        .unwrap();
        assert!(class.is_none());
        assert!(jpeg.is_none());
        assert_eq!(failure.unwrap().category, ErrorCategory::Encode);
    }

    #[test]
    fn test_success_passes_through_either_policy() {
        for policy in [ExplanationPolicy::FailRequest, ExplanationPolicy::ClassificationOnly] {
            let (class, jpeg, failure) =
                apply_policy(policy, Ok((3, vec![0xFF, 0xD8])), "a.jpg").unwrap();
            assert_eq!(class, Some(3));
            assert_eq!(jpeg.unwrap().len(), 2);
            assert!(failure.is_none());
        }
    }

    #[test]
    fn test_unavailable_health() {
        let health = HealthReport::unavailable(&ScreeningConfig::default());
        assert!(!health.model_loaded);
        assert_eq!(health.severity_classes.len(), 5);
    }
}
