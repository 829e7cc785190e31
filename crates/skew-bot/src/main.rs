//! skew-bot entry point.
//!
//! Runs the inventory-skewed market maker against simulated markets.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Inventory-skewed market maker (paper trading)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via SKEW_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config path: CLI arg > SKEW_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("SKEW_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = skew_bot::AppConfig::from_file(&config_path)?;
    skew_telemetry::init_logging(&config.telemetry.log_level)?;

    info!("Starting skew-bot v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %config_path,
        instruments = config.enabled_instruments().count(),
        direction = %config.engine.direction,
        incremental = config.engine.incremental_enabled,
        "Configuration loaded"
    );

    let app = skew_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}
