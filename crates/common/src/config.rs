//! Process-wide screening configuration
//!
//! Fixed at startup, never per request. Defaults match the deployed
//! ResNet-50 severity model; YAML files and `RETINA_*` environment
//! variables override them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::ScreeningError;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ScreeningError {
    fn from(err: ConfigError) -> Self {
        ScreeningError::Config(err.to_string())
    }
}

/// What to do when classification succeeded but the explanation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationPolicy {
    /// Fail the whole request
    #[default]
    FailRequest,
    /// Return the classification with no heatmap and record why
    ClassificationOnly,
}

/// Configuration for preprocessing, inference and explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Square model input size (H = W)
    pub input_size: u32,
    /// CLAHE clip limit, relative to the uniform bin height
    pub clahe_clip_limit: f32,
    /// CLAHE tile grid (columns, rows)
    pub clahe_tile_grid: (u32, u32),
    /// Per-channel mean in RGB order
    pub normalize_mean: [f32; 3],
    /// Per-channel standard deviation in RGB order
    pub normalize_std: [f32; 3],
    /// Ordered severity labels, one per classifier output
    pub severity_classes: Vec<String>,
    /// Backbone weights: `.onnx` export or native `.json`
    pub model_path: PathBuf,
    /// Pooled linear head weights (JSON)
    pub head_path: PathBuf,
    /// Accepted upload extensions (lowercase)
    pub allowed_extensions: BTreeSet<String>,
    /// Upload size limit in bytes
    pub max_image_bytes: usize,
    /// Predictions below this confidence are flagged for review
    pub confidence_threshold: f32,
    /// Heatmap weight when blending over the visualization image
    pub overlay_alpha: f32,
    /// JPEG quality for encoded outputs (1-100)
    pub jpeg_quality: u8,
    pub explanation_policy: ExplanationPolicy,
    /// Also return the resized original as JPEG
    pub include_original: bool,
    /// ONNX Runtime intra-op threads (None = physical cores)
    pub threads: Option<usize>,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            clahe_clip_limit: 2.0,
            clahe_tile_grid: (8, 8),
            normalize_mean: [0.485, 0.456, 0.406],
            normalize_std: [0.229, 0.224, 0.225],
            severity_classes: ["No DR", "Mild", "Moderate", "Severe", "Proliferative"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            model_path: PathBuf::from("models/dr_detection_model.onnx"),
            head_path: PathBuf::from("models/dr_detection_head.json"),
            allowed_extensions: ["jpg", "jpeg", "png"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_image_bytes: 10 * 1024 * 1024,
            confidence_threshold: 0.5,
            overlay_alpha: 0.5,
            jpeg_quality: 90,
            explanation_policy: ExplanationPolicy::FailRequest,
            include_original: true,
            threads: None,
        }
    }
}

impl ScreeningConfig {
    /// Load configuration from a YAML file; missing keys keep their defaults
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: ScreeningConfig = serde_yaml::from_str(&contents)?;
        debug!("Loaded screening config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply `RETINA_MODEL_PATH`, `RETINA_HEAD_PATH`, `RETINA_INPUT_SIZE` and
    /// `RETINA_THREADS` on top of this configuration
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(path) = lookup("RETINA_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("RETINA_HEAD_PATH") {
            self.head_path = PathBuf::from(path);
        }
        if let Some(value) = lookup("RETINA_INPUT_SIZE") {
            self.input_size = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "RETINA_INPUT_SIZE",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("RETINA_THREADS") {
            let threads = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "RETINA_THREADS",
                value: value.clone(),
            })?;
            self.threads = Some(threads);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants the pipeline relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_size == 0 {
            return Err(ConfigError::Invalid("input_size must be positive".into()));
        }
        if !(self.clahe_clip_limit > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "clahe_clip_limit must be positive, got {}",
                self.clahe_clip_limit
            )));
        }
        let (cols, rows) = self.clahe_tile_grid;
        if cols == 0 || rows == 0 || cols > self.input_size || rows > self.input_size {
            return Err(ConfigError::Invalid(format!(
                "clahe_tile_grid {cols}x{rows} does not fit a {0}x{0} input",
                self.input_size
            )));
        }
        if self.normalize_std.iter().any(|s| !(*s > 0.0)) {
            return Err(ConfigError::Invalid(
                "normalize_std entries must be positive".into(),
            ));
        }
        if self.severity_classes.is_empty() {
            return Err(ConfigError::Invalid("severity_classes is empty".into()));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid("allowed_extensions is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.overlay_alpha) {
            return Err(ConfigError::Invalid(format!(
                "overlay_alpha must be within [0, 1], got {}",
                self.overlay_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be within 1-100, got {}",
                self.jpeg_quality
            )));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = ScreeningConfig::default();
        assert_eq!(config.input_size, 224);
        assert_eq!(config.clahe_clip_limit, 2.0);
        assert_eq!(config.clahe_tile_grid, (8, 8));
        assert_eq!(config.severity_classes.len(), 5);
        assert_eq!(config.severity_classes[0], "No DR");
        assert_eq!(config.severity_classes[4], "Proliferative");
        assert!(config.allowed_extensions.contains("jpeg"));
        assert!(!config.allowed_extensions.contains("gif"));
        assert_eq!(config.explanation_policy, ExplanationPolicy::FailRequest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "input_size: 128\nclahe_tile_grid: [4, 4]\nexplanation_policy: classification_only"
        )
        .unwrap();

        let config = ScreeningConfig::from_yaml(file.path()).unwrap();
        assert_eq!(config.input_size, 128);
        assert_eq!(config.clahe_tile_grid, (4, 4));
        assert_eq!(
            config.explanation_policy,
            ExplanationPolicy::ClassificationOnly
        );
        // Untouched keys keep defaults
        assert_eq!(config.normalize_mean, [0.485, 0.456, 0.406]);
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "overlay_alpha: 1.5").unwrap();
        let err = ScreeningConfig::from_yaml(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RETINA_MODEL_PATH", "/opt/models/backbone.onnx"),
            ("RETINA_THREADS", "2"),
        ]
        .into_iter()
        .collect();

        let config = ScreeningConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.model_path, PathBuf::from("/opt/models/backbone.onnx"));
        assert_eq!(config.threads, Some(2));
        assert_eq!(config.input_size, 224);
    }

    #[test]
    fn test_env_override_parse_error() {
        let err = ScreeningConfig::default()
            .with_overrides(|name| (name == "RETINA_INPUT_SIZE").then(|| "huge".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                name: "RETINA_INPUT_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_zero_std() {
        let config = ScreeningConfig {
            normalize_std: [0.229, 0.0, 0.225],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
