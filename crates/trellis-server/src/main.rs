//! # Trellis Gateway
//!
//! WebSocket session gateway: one persistent connection per browser tab,
//! message routing, JWT session auth with proactive refresh, and idle
//! reaping.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! trellis
//!
//! # Run with a config file in the working directory
//! cp trellis.toml . && trellis
//!
//! # Run with environment variables
//! TRELLIS_PORT=8080 TRELLIS_HOST=0.0.0.0 trellis
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Trellis gateway on {}:{}", config.host, config.port);

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
    }

    // Serve until shutdown
    handlers::run_server(config).await?;

    Ok(())
}
