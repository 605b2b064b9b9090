//! line-bridge binary: load configuration, set up logging, run the server.

use line_bridge::config::Config;
use line_bridge::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.address,
        port = config.port,
        backlog = config.backlog,
        line_capacity = config.line_capacity,
        echo = config.echo,
        peer_close = ?config.peer_close,
        sink = ?config.telemetry_sink,
        "Starting line-bridge"
    );

    runtime::run(config)?;
    info!("Application exiting");
    Ok(())
}
