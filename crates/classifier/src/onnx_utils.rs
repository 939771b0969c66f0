//! ONNX Runtime utilities for backbone loading
//!
//! Sessions are built once at startup with graph optimizations and a fixed
//! intra-op thread count, then shared behind a mutex.

use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Error type for ONNX operations
#[derive(Debug, thiserror::Error)]
pub enum OnnxError {
    #[error("Failed to create session builder: {0}")]
    SessionBuilderError(String),

    #[error("Failed to load ONNX model from {path}: {error}")]
    ModelLoadError { path: String, error: String },

    #[error("Model file not found: {0}")]
    ModelNotFound(String),
}

/// Intra-op thread count: the configured value, else physical cores
///
/// `RETINA_THREADS` is already folded into the configuration by
/// `ScreeningConfig::with_env_overrides`.
#[must_use]
pub fn resolve_threads(threads: Option<usize>) -> usize {
    threads
        .filter(|n| *n > 0)
        .unwrap_or_else(num_cpus::get_physical)
}

/// Create an optimized CPU ONNX Runtime session
///
/// # Arguments
/// * `model_path` - Path to the ONNX model file
/// * `threads` - Intra-op parallelism (None = physical cores)
///
/// # Errors
/// * `OnnxError::ModelNotFound` if the file does not exist
/// * `OnnxError::ModelLoadError` if ONNX Runtime rejects the model
pub fn create_session(model_path: &Path, threads: Option<usize>) -> Result<Session, OnnxError> {
    if !model_path.exists() {
        return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
    }

    let num_threads = resolve_threads(threads);
    let start = Instant::now();

    let session = Session::builder()
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_intra_threads(num_threads)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_memory_pattern(true)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| OnnxError::ModelLoadError {
            path: model_path.display().to_string(),
            error: e.to_string(),
        })?;

    debug!("ONNX session intra-op threads: {}", num_threads);
    info!(
        "ONNX session created for {} in {:.3}s",
        model_path.display(),
        start.elapsed().as_secs_f64()
    );

    Ok(session)
}
