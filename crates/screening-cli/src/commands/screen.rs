//! Single-image screening

use anyhow::{Context as _, Result};
use clap::Args;
use retina_screening_core::{ScreeningConfig, ScreeningService};
use std::path::PathBuf;
use tracing::info;

use super::{output_paths, upload_name};

#[derive(Args)]
pub struct ScreenCommand {
    /// Fundus photograph (jpg, jpeg or png)
    #[arg(value_name = "IMAGE")]
    input: PathBuf,

    /// Explain this class index instead of the predicted one
    #[arg(long)]
    target_class: Option<usize>,

    /// Directory for the heatmap and resized original (default: next to the input)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl ScreenCommand {
    pub fn execute(self, config: ScreeningConfig) -> Result<()> {
        let service = ScreeningService::new(config).context("Failed to load screening model")?;

        let bytes = std::fs::read(&self.input)
            .with_context(|| format!("Failed to read {}", self.input.display()))?;

        let report = match service.screen_with_target(
            &bytes,
            &upload_name(&self.input),
            self.target_class,
        ) {
            Ok(report) => report,
            Err(err) => {
                println!("{}", serde_json::to_string_pretty(&err.to_failure())?);
                return Err(err).context(format!("Failed to screen {}", self.input.display()));
            }
        };

        let (heatmap_path, original_path) = output_paths(&self.input, self.output_dir.as_deref());
        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        if let Some(jpeg) = &report.heatmap_jpeg {
            std::fs::write(&heatmap_path, jpeg)
                .with_context(|| format!("Failed to write {}", heatmap_path.display()))?;
            info!("Heatmap written to {}", heatmap_path.display());
        }
        if let Some(jpeg) = &report.original_jpeg {
            std::fs::write(&original_path, jpeg)
                .with_context(|| format!("Failed to write {}", original_path.display()))?;
        }

        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
