//! Retina Screen CLI - diabetic retinopathy screening with Grad-CAM heatmaps
//!
//! Command-line front end for the screening core.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::bulk::BulkCommand;
use commands::screen::ScreenCommand;

#[derive(Parser)]
#[command(
    name = "retina-screen",
    version,
    about = "Diabetic retinopathy screening for retinal fundus photographs",
    long_about = "Classify fundus photographs into five severity grades and render a Grad-CAM\n\
                  heatmap showing which regions drove the prediction.\n\n\
                  Three commands:\n  \
                  - screen: one image, writes heatmap + resized original next to it\n  \
                  - bulk: many images in parallel, one JSON line per file\n  \
                  - info: model and configuration health",
    after_help = "EXAMPLES:\n  \
                  retina-screen screen fundus.jpg\n  \
                  retina-screen screen --target-class 3 --output-dir ./out fundus.jpg\n  \
                  retina-screen bulk --output-dir ./out scans/*.png > results.jsonl\n  \
                  retina-screen --config screening.yaml info"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file (defaults + RETINA_* environment otherwise)
    #[arg(short, long, global = true, value_name = "YAML")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Screen a single image
    Screen(ScreenCommand),

    /// Screen many images in parallel
    Bulk(BulkCommand),

    /// Print model and configuration health
    Info,
}

fn main() -> Result<()> {
    // Bulk parallelism, separate from ONNX Runtime intra-op threads
    if let Ok(threads_str) = std::env::var("RETINA_BULK_THREADS") {
        if let Ok(num_threads) = threads_str.parse::<usize>() {
            ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global()
                .ok();
        }
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Info => Level::WARN,
        _ => {
            if cli.verbose {
                Level::DEBUG
            } else {
                Level::INFO
            }
        }
    };

    // Logs go to stderr so stdout stays machine-readable JSON
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Screen(cmd) => cmd.execute(config),
        Commands::Bulk(cmd) => cmd.execute(config),
        Commands::Info => commands::info::print_health(config),
    }
}
