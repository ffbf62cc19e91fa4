//! Exclusive claims against a pool table
//!
//! Every pool follows the same protocol: open a transaction, lock the first
//! free row that matches, mark it taken and commit. Two claimants can never
//! leave with the same row because the second one either waits on the lock and
//! then sees the row as taken, or skips it for the next free one.

use pool_store::{
    ExportDevice, FixedIp, FloatingIp, NetworkIndex, PoolStore, PoolTransaction, Record,
};
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, Result};

/// Pools the allocator hands rows out of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    FloatingIps,
    FixedIps,
    NetworkIndexes,
    ExportDevices,
}

impl Pool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FloatingIps => "floating_ips",
            Self::FixedIps => "fixed_ips",
            Self::NetworkIndexes => "network_indexes",
            Self::ExportDevices => "export_devices",
        }
    }

    /// Error returned when nothing in the pool is free
    pub fn exhausted(&self) -> PoolError {
        match self {
            Self::FloatingIps | Self::FixedIps => PoolError::NoMoreAddresses,
            Self::NetworkIndexes => PoolError::NoMoreNetworks,
            Self::ExportDevices => PoolError::NoMoreBlades,
        }
    }
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row the allocator can claim
pub trait Claimable: Record {
    const POOL: Pool;

    /// True while no claim field is set
    fn is_free(&self) -> bool;
}

impl Claimable for FloatingIp {
    const POOL: Pool = Pool::FloatingIps;

    fn is_free(&self) -> bool {
        self.project_id.is_none() && self.fixed_ip_id.is_none()
    }
}

impl Claimable for FixedIp {
    const POOL: Pool = Pool::FixedIps;

    fn is_free(&self) -> bool {
        !self.reserved && !self.allocated && !self.leased
    }
}

impl Claimable for NetworkIndex {
    const POOL: Pool = Pool::NetworkIndexes;

    fn is_free(&self) -> bool {
        self.network_id.is_none()
    }
}

impl Claimable for ExportDevice {
    const POOL: Pool = Pool::ExportDevices;

    fn is_free(&self) -> bool {
        self.volume_id.is_none()
    }
}

/// Claims rows out of the pools of one store
#[derive(Debug, Clone)]
pub struct Allocator<S: PoolStore> {
    store: S,
}

impl<S: PoolStore> Allocator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim the first free row matching `scope` and mark it with `claim`.
    ///
    /// Returns the committed row, or the pool's exhaustion error when no free
    /// row matches.
    pub async fn claim_one<R, F, C>(&self, scope: F, claim: C) -> Result<R>
    where
        R: Claimable,
        F: Fn(&R) -> bool + Send + Sync,
        C: FnOnce(&mut R) + Send,
    {
        let pool = R::POOL;
        let mut tx = self.store.begin().await?;

        let candidate = tx
            .select_for_update::<R, _>(|row| row.is_free() && scope(row))
            .await?;
        let Some(mut row) = candidate else {
            tx.rollback().await?;
            warn!(pool = %pool, "Pool exhausted");
            return Err(pool.exhausted());
        };

        claim(&mut row);
        tx.update(row.clone())?;
        if let Err(e) = tx.commit().await {
            error!(pool = %pool, key = ?row.key(), "Failed to commit claim: {}", e);
            return Err(e.into());
        }

        info!(pool = %pool, key = ?row.key(), "Claimed pool row");
        Ok(row)
    }

    /// Lock the first row matching `filter`, apply `change` and commit.
    ///
    /// `None` when no row matches. An error from `change` rolls the
    /// transaction back.
    pub async fn modify_one<R, F, C>(&self, filter: F, change: C) -> Result<Option<R>>
    where
        R: Record,
        F: Fn(&R) -> bool + Send + Sync,
        C: FnOnce(&mut R) -> Result<()> + Send,
    {
        let mut tx = self.store.begin().await?;
        let Some(mut row) = tx.select_for_update::<R, _>(filter).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        if let Err(e) = change(&mut row) {
            tx.rollback().await?;
            return Err(e);
        }
        tx.update(row.clone())?;
        tx.commit().await?;
        debug!(table = R::TABLE, key = ?row.key(), "Updated row");
        Ok(Some(row))
    }
}
