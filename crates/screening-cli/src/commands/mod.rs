pub mod bulk;
pub mod info;
pub mod screen;

use anyhow::{Context as _, Result};
use retina_screening_core::ScreeningConfig;
use std::path::{Path, PathBuf};

/// YAML file if given, else defaults; environment overrides on top
pub fn load_config(path: Option<&Path>) -> Result<ScreeningConfig> {
    let base = match path {
        Some(path) => ScreeningConfig::from_yaml(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ScreeningConfig::default(),
    };
    base.with_env_overrides()
        .context("Invalid RETINA_* environment override")
}

/// `<dir>/<stem>_heatmap.jpg` and `<dir>/<stem>_original.jpg`
///
/// `dir` defaults to the input's own directory.
pub fn output_paths(input: &Path, output_dir: Option<&Path>) -> (PathBuf, PathBuf) {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    (
        dir.join(format!("{stem}_heatmap.jpg")),
        dir.join(format!("{stem}_original.jpg")),
    )
}

/// Filename handed to the extension check
pub fn upload_name(input: &Path) -> String {
    input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
