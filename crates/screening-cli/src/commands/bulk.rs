//! Bulk mode - parallel screening, one JSON line per file

use anyhow::{Context as _, Result};
use clap::Args;
use rayon::prelude::*;
use retina_screening_core::{
    ErrorCategory, Failure, ScreeningConfig, ScreeningError, ScreeningReport, ScreeningService,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use super::{output_paths, upload_name};

#[derive(Args)]
pub struct BulkCommand {
    /// Fundus photographs to screen
    #[arg(value_name = "FILES", required = true)]
    inputs: Vec<PathBuf>,

    /// Explain this class index instead of each prediction
    #[arg(long)]
    target_class: Option<usize>,

    /// Write heatmaps and resized originals here (skipped if unset)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

/// One output line
#[derive(Serialize)]
struct BulkLine {
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<ScreeningReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<Failure>,
    /// Screening succeeded but the images could not be written
    #[serde(skip_serializing_if = "Option::is_none")]
    output_failure: Option<Failure>,
}

impl BulkLine {
    fn failed(&self) -> bool {
        self.failure.is_some() || self.output_failure.is_some()
    }
}

impl BulkCommand {
    pub fn execute(self, config: ScreeningConfig) -> Result<()> {
        info!("Screening {} files", self.inputs.len());
        let start = Instant::now();

        let service = ScreeningService::new(config).context("Failed to load screening model")?;
        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let failures = AtomicUsize::new(0);
        let lines: Vec<BulkLine> = self
            .inputs
            .par_iter()
            .map(|input| {
                let line = self.screen_one(&service, input);
                if line.failed() {
                    failures.fetch_add(1, Ordering::Relaxed);
                }
                line
            })
            .collect();

        for line in &lines {
            println!("{}", serde_json::to_string(line)?);
        }

        let failed = failures.load(Ordering::Relaxed);
        info!(
            "Screened {} files ({} failed) in {:.2}s",
            lines.len(),
            failed,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn screen_one(&self, service: &ScreeningService, input: &Path) -> BulkLine {
        let file = input.display().to_string();
        let failed = |failure: Failure| {
            warn!("{}: {}", file, failure.message);
            BulkLine {
                file: file.clone(),
                report: None,
                failure: Some(failure),
                output_failure: None,
            }
        };

        let bytes = match std::fs::read(input) {
            Ok(bytes) => bytes,
            Err(err) => return failed(ScreeningError::from(err).to_failure()),
        };

        match service.screen_with_target(&bytes, &upload_name(input), self.target_class) {
            Ok(report) => {
                let output_failure = self
                    .output_dir
                    .as_deref()
                    .and_then(|dir| output_failure(&report, input, dir));
                BulkLine {
                    file: file.clone(),
                    report: Some(report),
                    failure: None,
                    output_failure,
                }
            }
            Err(err) => failed(err.to_failure()),
        }
    }
}

/// Write the report's images, describing any write error as a `Failure`
fn output_failure(report: &ScreeningReport, input: &Path, dir: &Path) -> Option<Failure> {
    let err = write_images(report, input, dir).err()?;
    warn!("{}: {:#}", input.display(), err);
    Some(Failure {
        category: ErrorCategory::Internal,
        message: format!("{err:#}"),
    })
}

fn write_images(report: &ScreeningReport, input: &Path, dir: &Path) -> Result<()> {
    let (heatmap_path, original_path) = output_paths(input, Some(dir));
    if let Some(jpeg) = &report.heatmap_jpeg {
        std::fs::write(&heatmap_path, jpeg)
            .with_context(|| format!("Failed to write {}", heatmap_path.display()))?;
    }
    if let Some(jpeg) = &report.original_jpeg {
        std::fs::write(&original_path, jpeg)
            .with_context(|| format!("Failed to write {}", original_path.display()))?;
    }
    Ok(())
}
