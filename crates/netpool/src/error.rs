//! Allocation errors

use std::net::Ipv4Addr;

use pool_store::StoreError;
use thiserror::Error;

/// Result type alias using [`PoolError`]
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the allocator and the lifecycle managers
///
/// Nothing here is retried automatically. Exhaustion and lookups that find
/// nothing are expected conditions the caller decides how to handle.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Floating or fixed IP pool has no claimable address
    #[error("No more addresses available")]
    NoMoreAddresses,

    /// Every network index is bound to a network
    #[error("No more networks available")]
    NoMoreNetworks,

    /// Every export device is bound to a volume
    #[error("No more shelf/blade slots available")]
    NoMoreBlades,

    /// Lease attempted on an address that was never allocated
    #[error("Address not allocated: {0}")]
    AddressNotAllocated(Ipv4Addr),

    /// Address is already allocated to someone else
    #[error("Address already allocated: {0}")]
    AddressAlreadyAllocated(Ipv4Addr),

    /// Lookup by identifier or address found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Address or CIDR string could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration rejected on load
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage engine failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PoolError {
    /// True for the pool-exhausted family
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::NoMoreAddresses | Self::NoMoreNetworks | Self::NoMoreBlades
        )
    }
}
