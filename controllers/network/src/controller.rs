//! Main controller implementation.
//!
//! Builds the in-memory pools, seeds them from the environment and serves the
//! HTTP API until Ctrl-C.

use std::env;
use std::net::SocketAddr;

use ipnet::Ipv4Net;
use netpool::{Netpool, NetworkConfig};
use pool_store::MemoryPoolStore;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::error::ControllerError;
use crate::metrics::Metrics;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8775";

/// Process settings outside the network configuration
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub listen_addr: SocketAddr,
    /// Node whose floating IP pool this controller serves
    pub node_name: String,
    /// Floating IPs to create on startup
    pub floating_range: Option<Ipv4Net>,
    pub export_shelves: u16,
    pub export_blades: u16,
}

impl ControllerSettings {
    /// Read `NETPOOL_LISTEN_ADDR`, `NETPOOL_NODE_NAME`, `NETPOOL_FLOATING_RANGE`,
    /// `NETPOOL_EXPORT_SHELVES` and `NETPOOL_EXPORT_BLADES`
    pub fn from_env() -> Result<Self, ControllerError> {
        let listen_addr = env::var("NETPOOL_LISTEN_ADDR")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
        let node_name = env::var("NETPOOL_NODE_NAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        Ok(Self {
            listen_addr: parse("NETPOOL_LISTEN_ADDR", &listen_addr)?,
            node_name,
            floating_range: env::var("NETPOOL_FLOATING_RANGE")
                .ok()
                .map(|value| parse("NETPOOL_FLOATING_RANGE", &value))
                .transpose()?,
            export_shelves: optional("NETPOOL_EXPORT_SHELVES")?.unwrap_or(0),
            export_blades: optional("NETPOOL_EXPORT_BLADES")?.unwrap_or(0),
        })
    }
}

fn optional<T>(name: &str) -> Result<Option<T>, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env::var(name).ok().map(|value| parse(name, &value)).transpose()
}

fn parse<T>(name: &str, value: &str) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{}={:?}: {}", name, value, e)))
}

/// HTTP front end over one set of pools
pub struct Controller {
    listener: TcpListener,
    state: AppState,
}

impl Controller {
    /// Build and seed the pools, then bind the listener
    pub async fn new(
        settings: ControllerSettings,
        config: NetworkConfig,
    ) -> Result<Self, ControllerError> {
        info!("Initializing Network Controller");

        let pool = Netpool::new(MemoryPoolStore::new(), config);
        pool.networks.ensure_indexes().await?;

        if let Some(range) = settings.floating_range {
            let count = pool
                .floating_ips
                .create_range(&settings.node_name, range)
                .await?;
            info!("Seeded {} floating IPs from {}", count, range);
        }
        if settings.export_shelves > 0 && settings.export_blades > 0 {
            let count = pool
                .volumes
                .add_export_devices(settings.export_shelves, settings.export_blades)
                .await?;
            info!("Seeded {} export devices", count);
        }

        let state = AppState::new(pool, settings.node_name, Metrics::new()?);
        let listener = TcpListener::bind(settings.listen_addr).await?;

        Ok(Self { listener, state })
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(addr = ?self.listener.local_addr(), "Network Controller listening");
        axum::serve(self.listener, api::router(self.state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        info!("Network Controller stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
