//! Pool Store
//!
//! Transactional tables for finite, shared infrastructure resources: floating
//! IPs, fixed IPs, network index slots and storage export devices, plus the
//! networks and volumes that own them.
//!
//! Callers claim a free row with [`PoolTransaction::select_for_update`], which
//! holds an exclusive row lock until the transaction commits or rolls back.
//!
//! # Example
//!
//! ```
//! use pool_store::{MemoryPoolStore, NetworkIndex, PoolStore, PoolTransaction};
//!
//! # async fn example() -> Result<(), pool_store::StoreError> {
//! let store = MemoryPoolStore::new();
//!
//! let mut tx = store.begin().await?;
//! tx.insert(NetworkIndex::new(0))?;
//! tx.commit().await?;
//!
//! let mut tx = store.begin().await?;
//! if let Some(mut slot) = tx
//!     .select_for_update::<NetworkIndex, _>(|row| row.network_id.is_none())
//!     .await?
//! {
//!     slot.network_id = Some(1);
//!     tx.update(slot)?;
//! }
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memory;
pub mod models;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(feature = "test-util")]
pub mod testing;

pub use error::StoreError;
pub use memory::{MemoryPoolStore, MemoryTransaction};
pub use models::*;
pub use store_trait::{PoolStore, PoolTransaction, Record};
