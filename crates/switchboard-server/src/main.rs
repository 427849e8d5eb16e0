//! # Switchboard
//!
//! Distributed chat gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Single node, in-memory backends
//! SWITCHBOARD_JWT_SECRET=dev-secret switchboard
//!
//! # Run with a specific config file
//! SWITCHBOARD_CONFIG=/path/to/switchboard.toml switchboard
//!
//! # Override fields the config file leaves out
//! SWITCHBOARD_PORT=8080 SWITCHBOARD_HOST=0.0.0.0 switchboard
//! ```

use anyhow::Result;
use switchboard_core::NodeId;
use switchboard_server::{backends, config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    let node_id = NodeId::generate(config.node.resolve_hostname().as_deref(), config.port);
    tracing::info!(node = %node_id, "Starting Switchboard on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Connect backends and start the server
    let ctx = backends::build_context(&config, node_id).await?;
    handlers::run_server(config, ctx).await?;

    Ok(())
}
