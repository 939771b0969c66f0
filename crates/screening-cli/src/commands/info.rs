use anyhow::Result;
use retina_screening_core::{HealthReport, ScreeningConfig, ScreeningService};
use tracing::warn;

/// Load the model and print its health report; an unloadable model is reported, not fatal
pub fn print_health(config: ScreeningConfig) -> Result<()> {
    let health = match ScreeningService::new(config.clone()) {
        Ok(service) => service.health(),
        Err(err) => {
            warn!("Model not loaded: {}", err);
            HealthReport::unavailable(&config)
        }
    };
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}
