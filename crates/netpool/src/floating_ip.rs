//! Floating IP pool

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use pool_store::{FixedIp, FloatingIp, PoolStore, PoolTransaction};
use tracing::info;

use crate::allocator::Allocator;
use crate::error::{PoolError, Result};
use crate::subnet;

/// Allocates floating IPs to projects and links them to fixed IPs
#[derive(Debug, Clone)]
pub struct FloatingIpManager<S: PoolStore> {
    allocator: Allocator<S>,
}

impl<S: PoolStore> FloatingIpManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            allocator: Allocator::new(store),
        }
    }

    /// Add one address to `node_name`'s pool
    pub async fn create(&self, node_name: &str, address: Ipv4Addr) -> Result<FloatingIp> {
        let mut tx = self.allocator.store().begin().await?;
        let row = tx.insert(FloatingIp::new(address, node_name))?;
        tx.commit().await?;
        info!(node = node_name, %address, "Created floating IP");
        Ok(row)
    }

    /// Add every address of `block` to `node_name`'s pool in one transaction
    pub async fn create_range(&self, node_name: &str, block: Ipv4Net) -> Result<usize> {
        let mut tx = self.allocator.store().begin().await?;
        let mut count = 0;
        for address in subnet::addresses(block) {
            tx.insert(FloatingIp::new(address, node_name))?;
            count += 1;
        }
        tx.commit().await?;
        info!(node = node_name, %block, count, "Created floating IP range");
        Ok(count)
    }

    pub async fn get_by_address(&self, address: Ipv4Addr) -> Result<FloatingIp> {
        let tx = self.allocator.store().begin().await?;
        tx.find::<FloatingIp, _>(|row| row.address == address)?
            .ok_or_else(|| not_found(address))
    }

    /// Claim a free floating IP on `node_name` for `project_id`
    pub async fn allocate(&self, node_name: &str, project_id: &str) -> Result<Ipv4Addr> {
        let row = self
            .allocator
            .claim_one(
                |row: &FloatingIp| row.node_name == node_name,
                |row: &mut FloatingIp| row.project_id = Some(project_id.to_string()),
            )
            .await?;
        Ok(row.address)
    }

    /// Point the floating IP at `fixed_address`
    pub async fn associate(&self, floating_address: Ipv4Addr, fixed_address: Ipv4Addr) -> Result<()> {
        let mut tx = self.allocator.store().begin().await?;
        let fixed = tx
            .find::<FixedIp, _>(|row| row.address == fixed_address)?
            .ok_or_else(|| PoolError::NotFound(format!("fixed IP {}", fixed_address)))?;
        let mut floating = tx
            .select_for_update::<FloatingIp, _>(|row| row.address == floating_address)
            .await?
            .ok_or_else(|| not_found(floating_address))?;

        floating.fixed_ip_id = Some(fixed.id);
        tx.update(floating)?;
        tx.commit().await?;
        info!(floating = %floating_address, fixed = %fixed_address, "Associated floating IP");
        Ok(())
    }

    /// Unlink the floating IP and return the fixed address it pointed at
    pub async fn disassociate(&self, address: Ipv4Addr) -> Result<Ipv4Addr> {
        let mut tx = self.allocator.store().begin().await?;
        let mut floating = tx
            .select_for_update::<FloatingIp, _>(|row| row.address == address)
            .await?
            .ok_or_else(|| not_found(address))?;
        let fixed_id = floating.fixed_ip_id.take().ok_or_else(|| {
            PoolError::NotFound(format!("floating IP {} has no fixed IP", address))
        })?;
        let fixed = tx
            .get::<FixedIp>(&fixed_id)?
            .ok_or_else(|| PoolError::NotFound(format!("fixed IP {}", fixed_id)))?;

        tx.update(floating)?;
        tx.commit().await?;
        info!(floating = %address, fixed = %fixed.address, "Disassociated floating IP");
        Ok(fixed.address)
    }

    /// Return the floating IP to its pool. The fixed-IP link is left alone.
    pub async fn deallocate(&self, address: Ipv4Addr) -> Result<()> {
        self.allocator
            .modify_one(
                |row: &FloatingIp| row.address == address,
                |row: &mut FloatingIp| {
                    row.project_id = None;
                    Ok(())
                },
            )
            .await?
            .ok_or_else(|| not_found(address))?;
        info!(%address, "Deallocated floating IP");
        Ok(())
    }
}

fn not_found(address: Ipv4Addr) -> PoolError {
    PoolError::NotFound(format!("floating IP {}", address))
}
