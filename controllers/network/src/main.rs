//! Network Controller
//!
//! Serves the resource-pool allocator over HTTP:
//! - Networks: provisioning, host assignment, project lookup
//! - Fixed IPs: allocate / lease / release lifecycle
//! - Floating IPs: project allocation and fixed-IP association
//! - Volumes: export device slots and attachment state
//!
//! Pool state lives in memory for the lifetime of the process.

mod api;
mod controller;
mod error;
mod metrics;

use anyhow::Result;
use controller::{Controller, ControllerSettings};
use netpool::NetworkConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Network Controller");

    let config = NetworkConfig::load()?;
    let settings = ControllerSettings::from_env()?;

    info!("Configuration:");
    info!("  Listen address: {}", settings.listen_addr);
    info!("  Node name: {}", settings.node_name);
    info!("  Private range: {}", config.private_range);
    info!("  Networks: {} x {} addresses", config.num_networks, config.network_size);

    let controller = Controller::new(settings, config).await?;
    controller.run().await?;

    Ok(())
}
