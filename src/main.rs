use buttoncast::button::RppalSampler;
use buttoncast::config::Config;
use buttoncast::supervisor::{Supervisor, SupervisorError};
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = Config::load().await?;
    info!("Using config: {:?}", config);

    // Without the pin there is nothing to serve.
    let sampler = RppalSampler::claim(
        config.gpio.pin,
        config.gpio.bias,
        config.gpio.active_level,
    )
    .map_err(SupervisorError::from)?;

    let handle = Supervisor::start(&config, Box::new(sampler), config.terminator())
        .await
        .map_err(|e| eyre!("Failed to start: {}", e))?;
    info!("Listening for WebSocket clients on {}", handle.local_addr());

    let report = handle.wait().await?;
    info!("Stopped ({}): {:?}", report.reason, report);
    if !report.pin_released {
        error!("GPIO pin was not released cleanly");
    }
    if !report.connections_closed {
        warn!("Some client connections were dropped without a close handshake");
    }

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
