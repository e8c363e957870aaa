use anyhow::Result;
use eos::bus::HttpEntityBus;
use eos::engine::EnergyEngine;
use eos::logging;
use eos::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Eos energy engine starting up");

    // Token may come from the environment instead of the config file
    let token = if config.hass.token.is_empty() {
        std::env::var("EOS_HASS_TOKEN").unwrap_or_default()
    } else {
        config.hass.token.clone()
    };

    let bus = HttpEntityBus::new(
        &config.hass.base_url,
        &token,
        Duration::from_secs(config.hass.timeout_s),
    )
    .map_err(|e| anyhow::anyhow!("Failed to create bus client: {}", e))?;

    let mut engine = EnergyEngine::new(config, Arc::new(bus))
        .map_err(|e| anyhow::anyhow!("Failed to create engine: {}", e))?;

    // Ctrl-C requests a clean shutdown
    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.send(()).ok();
        }
    });

    match engine.run().await {
        Ok(()) => {
            info!("Engine shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Engine failed with error: {}", e);
            Err(anyhow::anyhow!("Engine error: {}", e))
        }
    }
}
