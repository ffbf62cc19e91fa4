//! Seeding helpers for tests
//!
//! Fill pool tables directly, bypassing the allocator.

use std::net::Ipv4Addr;

use crate::error::StoreError;
use crate::models::*;
use crate::store_trait::{PoolStore, PoolTransaction};

/// Insert one floating IP per address for `node_name`
pub async fn seed_floating_ips<S: PoolStore>(
    store: &S,
    node_name: &str,
    addresses: impl IntoIterator<Item = Ipv4Addr>,
) -> Result<Vec<FloatingIp>, StoreError> {
    let mut tx = store.begin().await?;
    let mut rows = Vec::new();
    for address in addresses {
        rows.push(tx.insert(FloatingIp::new(address, node_name))?);
    }
    tx.commit().await?;
    Ok(rows)
}

/// Insert free fixed IPs for `network_id`
pub async fn seed_fixed_ips<S: PoolStore>(
    store: &S,
    network_id: NetworkId,
    addresses: impl IntoIterator<Item = Ipv4Addr>,
) -> Result<Vec<FixedIp>, StoreError> {
    let mut tx = store.begin().await?;
    let mut rows = Vec::new();
    for address in addresses {
        rows.push(tx.insert(FixedIp::new(address, network_id, false))?);
    }
    tx.commit().await?;
    Ok(rows)
}

/// Insert `count` free network index rows starting at 0
pub async fn seed_network_indexes<S: PoolStore>(store: &S, count: u32) -> Result<(), StoreError> {
    let mut tx = store.begin().await?;
    for index in 0..count {
        tx.insert(NetworkIndex::new(index))?;
    }
    tx.commit().await
}

/// Insert a network row with only its project set
pub async fn seed_network<S: PoolStore>(store: &S, project_id: &str) -> Result<Network, StoreError> {
    let mut tx = store.begin().await?;
    let network = tx.insert(Network::new(project_id))?;
    tx.commit().await?;
    Ok(network)
}

/// Insert a detached volume
pub async fn seed_volume<S: PoolStore>(store: &S) -> Result<Volume, StoreError> {
    let mut tx = store.begin().await?;
    let volume = tx.insert(Volume::new(None, 1))?;
    tx.commit().await?;
    Ok(volume)
}

/// Address `10.0.<third>.<fourth>`
pub fn test_address(third: u8, fourth: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, third, fourth)
}
