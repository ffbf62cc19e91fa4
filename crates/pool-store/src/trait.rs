//! Storage engine contract
//!
//! The allocator only ever talks to storage through these two traits. An engine
//! provides short-lived transactions with an exclusive row lock that is held
//! until commit or rollback.
//!
//! # Operating constraint
//!
//! The claim protocol is pessimistic: a claimant locks one candidate row, marks
//! it taken and commits. An engine that cannot honour `select_for_update`
//! exclusively (for example one that silently ignores the lock) degrades every
//! pool to race-prone double allocation. `MemoryPoolStore` honours it.

use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// A row type stored in its own table
pub trait Record: Clone + Debug + Send + Sync + 'static {
    /// Primary key
    type Key: Clone + Debug + Ord + Hash + Send + Sync + 'static;

    /// Table name, unique per record type
    const TABLE: &'static str;

    fn key(&self) -> Self::Key;

    /// Called on insert with the table's next sequence value. Tables keyed by
    /// a natural key ignore it.
    fn assign_key(&mut self, _sequence: u64) {}

    /// Secondary key that must be unique across the table (addresses)
    fn unique_key(&self) -> Option<String> {
        None
    }

    /// Stamp the row's modification time
    fn touch(&mut self, _now: DateTime<Utc>) {}
}

/// Handle to a storage engine
///
/// Cloning is cheap; every clone talks to the same tables.
#[async_trait::async_trait]
pub trait PoolStore: Clone + Send + Sync + 'static {
    type Transaction: PoolTransaction;

    /// Open a new transaction
    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// One transaction against a [`PoolStore`]
///
/// Reads observe committed state. Writes are buffered and become visible
/// together at commit; a transaction dropped without commit rolls back and
/// releases its row locks.
#[async_trait::async_trait]
pub trait PoolTransaction: Send + Sized {
    /// Select the first row matching `filter` and lock it exclusively until
    /// this transaction ends.
    ///
    /// Waits while every matching row is locked by another transaction.
    /// Returns `None` as soon as no row matches.
    async fn select_for_update<R, F>(&mut self, filter: F) -> Result<Option<R>, StoreError>
    where
        R: Record,
        F: Fn(&R) -> bool + Send + Sync;

    /// Lock the row with `key` exclusively, waiting for any other holder.
    async fn lock<R: Record>(&mut self, key: &R::Key) -> Result<Option<R>, StoreError>;

    /// Row by primary key, without locking
    fn get<R: Record>(&self, key: &R::Key) -> Result<Option<R>, StoreError>;

    /// First row (in key order) matching `filter`, without locking
    fn find<R, F>(&self, filter: F) -> Result<Option<R>, StoreError>
    where
        R: Record,
        F: Fn(&R) -> bool;

    /// All rows matching `filter` in key order, without locking
    fn filter<R, F>(&self, filter: F) -> Result<Vec<R>, StoreError>
    where
        R: Record,
        F: Fn(&R) -> bool;

    /// Number of committed rows in the table
    fn count<R: Record>(&self) -> Result<usize, StoreError>;

    /// Stage an insert. Sequence-keyed rows get their key here and the staged
    /// row is returned.
    fn insert<R: Record>(&mut self, row: R) -> Result<R, StoreError>;

    /// Stage a full-row update
    fn update<R: Record>(&mut self, row: R) -> Result<(), StoreError>;

    /// Stage a delete
    fn delete<R: Record>(&mut self, key: &R::Key) -> Result<(), StoreError>;

    /// Apply every staged write atomically and release all locks.
    ///
    /// On error nothing was applied and the locks are released.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard staged writes and release all locks
    async fn rollback(self) -> Result<(), StoreError>;
}
