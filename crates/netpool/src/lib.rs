//! Netpool
//!
//! Exclusive allocation of shared infrastructure resources (floating IPs,
//! fixed IPs, network index slots and export devices) and the network
//! provisioning workflow built on top of it.
//!
//! # Example
//!
//! ```
//! use netpool::{NetworkConfig, Netpool};
//! use pool_store::MemoryPoolStore;
//!
//! # async fn example() -> Result<(), netpool::PoolError> {
//! let config = NetworkConfig {
//!     num_networks: 4,
//!     ..Default::default()
//! };
//! let pool = Netpool::new(MemoryPoolStore::new(), config);
//!
//! // Claims index 0 and fills 10.0.0.0/24 with fixed IPs
//! let network = pool.networks.provision("proj-a").await?;
//! let address = pool.fixed_ips.allocate(network.id).await?;
//! pool.fixed_ips.lease(address).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Allocator**: lock-claim-commit protocol shared by every pool
//! - **Fixed IPs**: allocate / lease / release state machine
//! - **Floating IPs**: per-node pools, project allocation, fixed-IP association
//! - **Networks**: index claim, subnet derivation, fixed IP population, host assignment
//! - **Volumes**: export device slots and attach/detach state

pub mod allocator;
pub mod config;
pub mod error;
pub mod fixed_ip;
pub mod floating_ip;
pub mod network;
pub mod subnet;
pub mod volume;

pub use allocator::{Allocator, Claimable, Pool};
pub use config::NetworkConfig;
pub use error::{PoolError, Result};
pub use fixed_ip::FixedIpManager;
pub use floating_ip::FloatingIpManager;
pub use network::NetworkProvisioner;
pub use volume::VolumeManager;

use pool_store::PoolStore;

/// Every manager, sharing one store
#[derive(Debug, Clone)]
pub struct Netpool<S: PoolStore> {
    pub floating_ips: FloatingIpManager<S>,
    pub fixed_ips: FixedIpManager<S>,
    pub networks: NetworkProvisioner<S>,
    pub volumes: VolumeManager<S>,
}

impl<S: PoolStore> Netpool<S> {
    pub fn new(store: S, config: NetworkConfig) -> Self {
        Self {
            floating_ips: FloatingIpManager::new(store.clone()),
            fixed_ips: FixedIpManager::new(store.clone()),
            networks: NetworkProvisioner::new(store.clone(), config),
            volumes: VolumeManager::new(store),
        }
    }
}
