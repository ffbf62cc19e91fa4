//! Fixed IP lifecycle
//!
//! A fixed IP moves free -> allocated -> leased and back to free through
//! `release`. `deallocate` only clears the allocation flag, so an address can
//! briefly sit leased-but-unallocated until the lease is released.
//! Instance association is tracked separately from these flags.

use std::net::Ipv4Addr;

use pool_store::{FixedIp, NetworkId, PoolStore, PoolTransaction};
use tracing::{debug, info};

use crate::allocator::Allocator;
use crate::error::{PoolError, Result};

#[derive(Debug, Clone)]
pub struct FixedIpManager<S: PoolStore> {
    allocator: Allocator<S>,
}

impl<S: PoolStore> FixedIpManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            allocator: Allocator::new(store),
        }
    }

    /// Claim a free, unreserved address of `network_id`
    pub async fn allocate(&self, network_id: NetworkId) -> Result<Ipv4Addr> {
        let row = self
            .allocator
            .claim_one(
                |row: &FixedIp| row.network_id == network_id,
                |row: &mut FixedIp| row.allocated = true,
            )
            .await?;
        Ok(row.address)
    }

    /// Mark an allocated address as in use
    pub async fn lease(&self, address: Ipv4Addr) -> Result<FixedIp> {
        let row = self
            .modify(address, |row| {
                if !row.allocated {
                    return Err(PoolError::AddressNotAllocated(address));
                }
                row.leased = true;
                Ok(())
            })
            .await?;
        info!(%address, "Leased fixed IP");
        Ok(row)
    }

    /// Return the address to the pool, whatever state it is in
    pub async fn release(&self, address: Ipv4Addr) -> Result<FixedIp> {
        let row = self
            .modify(address, |row| {
                row.allocated = false;
                row.leased = false;
                Ok(())
            })
            .await?;
        info!(%address, "Released fixed IP");
        Ok(row)
    }

    /// Clear the allocation flag; an active lease stays in place
    pub async fn deallocate(&self, address: Ipv4Addr) -> Result<FixedIp> {
        let row = self
            .modify(address, |row| {
                row.allocated = false;
                Ok(())
            })
            .await?;
        info!(%address, leased = row.leased, "Deallocated fixed IP");
        Ok(row)
    }

    pub async fn associate_instance(&self, address: Ipv4Addr, instance_id: &str) -> Result<FixedIp> {
        let row = self
            .modify(address, |row| {
                row.instance_id = Some(instance_id.to_string());
                Ok(())
            })
            .await?;
        debug!(%address, instance_id, "Associated fixed IP with instance");
        Ok(row)
    }

    pub async fn disassociate_instance(&self, address: Ipv4Addr) -> Result<FixedIp> {
        let row = self
            .modify(address, |row| {
                row.instance_id = None;
                Ok(())
            })
            .await?;
        debug!(%address, "Disassociated fixed IP from instance");
        Ok(row)
    }

    pub async fn get_by_address(&self, address: Ipv4Addr) -> Result<FixedIp> {
        let tx = self.allocator.store().begin().await?;
        tx.find::<FixedIp, _>(|row| row.address == address)?
            .ok_or_else(|| not_found(address))
    }

    /// Every fixed IP of `network_id`, in creation order
    pub async fn list(&self, network_id: NetworkId) -> Result<Vec<FixedIp>> {
        let tx = self.allocator.store().begin().await?;
        Ok(tx.filter::<FixedIp, _>(|row| row.network_id == network_id)?)
    }

    async fn modify<C>(&self, address: Ipv4Addr, change: C) -> Result<FixedIp>
    where
        C: FnOnce(&mut FixedIp) -> Result<()> + Send,
    {
        self.allocator
            .modify_one(|row: &FixedIp| row.address == address, change)
            .await?
            .ok_or_else(|| not_found(address))
    }
}

fn not_found(address: Ipv4Addr) -> PoolError {
    PoolError::NotFound(format!("fixed IP {}", address))
}
