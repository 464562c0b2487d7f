//! OpenSASE Steer - Main Entry Point

use opensase_steer::{ControllerConfig, SteerController};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE Steer v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("STEER_CONFIG")
        .unwrap_or_else(|_| "/etc/opensase/steer.json".into());

    let config = ControllerConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Config {} not loaded ({}), using defaults", config_path, e);
        ControllerConfig::default()
    });

    // Policy is loaded but not installed; GET /activate reconciles switches
    let controller = SteerController::new(config).await?;
    controller.run().await?;

    Ok(())
}
