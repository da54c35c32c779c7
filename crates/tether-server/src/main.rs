//! # Tether Server
//!
//! Hosts the authoritative copy of every channel its clients join and relays
//! each client's events to the other subscribers.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tether
//!
//! # Run with custom config
//! tether --config /path/to/tether.toml
//!
//! # Run with environment variables
//! TETHER_PORT=8080 TETHER_HOST=0.0.0.0 tether
//! ```

mod config;
mod handlers;
mod history;
mod hub;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::from_args(std::env::args().skip(1))?;

    tracing::info!("Starting Tether server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
