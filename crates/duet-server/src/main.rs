//! # Duet Server
//!
//! Realtime direct-messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (reads ./duet.toml if present)
//! duet
//!
//! # Run with environment overrides
//! DUET_PORT=8080 DUET_HOST=0.0.0.0 DUET_HEARTBEAT__INTERVAL_MS=15000 duet
//! ```

use anyhow::Result;
use duet_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "duet=debug,duet_core=debug,duet_server=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Duet server on {}:{}", config.host, config.port);
    if config.users.is_empty() {
        tracing::warn!("No users configured; every connection will be rejected");
    }

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
