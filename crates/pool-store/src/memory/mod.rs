//! In-memory pool store
//!
//! Every table lives behind its own mutex; row locks are tracked per table and
//! held by a transaction until it commits, rolls back or is dropped. Commits
//! are serialised through a single gate so that validation and application of
//! one transaction's writes never interleave with another commit.

mod table;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::models::{ExportDevice, FixedIp, FloatingIp, Network, NetworkIndex, Volume};
use crate::store_trait::{PoolStore, PoolTransaction, Record};
use table::{Changeset, HeldLock, RowLock, StagedWrites, Table, TxId};

struct Database {
    tables: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    commit_gate: AsyncMutex<()>,
    next_tx: AtomicU64,
}

impl Database {
    fn table<R: Record>(&self) -> Result<Arc<Table<R>>, StoreError> {
        self.tables
            .get(R::TABLE)
            .cloned()
            .ok_or(StoreError::UnknownTable(R::TABLE))?
            .downcast::<Table<R>>()
            .map_err(|_| StoreError::UnknownTable(R::TABLE))
    }
}

/// Pool store kept in process memory
///
/// Holds the floating IP, fixed IP, network, network index, export device and
/// volume tables.
#[derive(Clone)]
pub struct MemoryPoolStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for MemoryPoolStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPoolStore")
            .field("tables", &self.db.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryPoolStore {
    /// Create an empty store
    pub fn new() -> Self {
        let mut tables: HashMap<&'static str, Arc<dyn Any + Send + Sync>> = HashMap::new();
        register::<FloatingIp>(&mut tables);
        register::<FixedIp>(&mut tables);
        register::<Network>(&mut tables);
        register::<NetworkIndex>(&mut tables);
        register::<ExportDevice>(&mut tables);
        register::<Volume>(&mut tables);

        Self {
            db: Arc::new(Database {
                tables,
                commit_gate: AsyncMutex::new(()),
                next_tx: AtomicU64::new(1),
            }),
        }
    }
}

impl Default for MemoryPoolStore {
    fn default() -> Self {
        Self::new()
    }
}

fn register<R: Record>(tables: &mut HashMap<&'static str, Arc<dyn Any + Send + Sync>>) {
    tables.insert(R::TABLE, Arc::new(Table::<R>::new()));
}

#[async_trait::async_trait]
impl PoolStore for MemoryPoolStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let id = self.db.next_tx.fetch_add(1, Ordering::Relaxed);
        trace!(tx = id, "Transaction started");
        Ok(MemoryTransaction {
            id,
            db: Arc::clone(&self.db),
            held: Vec::new(),
            staged: Vec::new(),
        })
    }
}

/// Transaction against a [`MemoryPoolStore`]
pub struct MemoryTransaction {
    id: TxId,
    db: Arc<Database>,
    held: Vec<Box<dyn HeldLock>>,
    staged: Vec<Box<dyn StagedWrites>>,
}

impl std::fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("id", &self.id)
            .field("locks", &self.held.len())
            .field("tables", &self.staged.iter().map(|s| s.table_name()).collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryTransaction {
    fn changeset<R: Record>(&mut self) -> Result<&mut Changeset<R>, StoreError> {
        let position = match self.staged.iter().position(|s| s.table_name() == R::TABLE) {
            Some(position) => position,
            None => {
                let table = self.db.table::<R>()?;
                self.staged.push(Box::new(Changeset::new(table)));
                self.staged.len() - 1
            }
        };
        self.staged[position]
            .as_any_mut()
            .downcast_mut::<Changeset<R>>()
            .ok_or(StoreError::UnknownTable(R::TABLE))
    }

    fn hold<R: Record>(&mut self, table: &Arc<Table<R>>, key: R::Key) {
        self.held.push(Box::new(RowLock {
            table: Arc::clone(table),
            key,
        }));
    }

    fn release_locks(&mut self) {
        for lock in self.held.drain(..) {
            lock.release(self.id);
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            debug!(tx = self.id, locks = self.held.len(), "Transaction dropped, rolling back");
        }
        self.release_locks();
    }
}

#[async_trait::async_trait]
impl PoolTransaction for MemoryTransaction {
    async fn select_for_update<R, F>(&mut self, filter: F) -> Result<Option<R>, StoreError>
    where
        R: Record,
        F: Fn(&R) -> bool + Send + Sync,
    {
        let table = self.db.table::<R>()?;
        loop {
            let released = table.released.notified();
            tokio::pin!(released);
            // Register before inspecting the locks so a release in between is not missed
            released.as_mut().enable();

            {
                let mut state = table.state();
                let mut contended = false;
                let mut chosen = None;
                for (key, row) in &state.rows {
                    if !filter(row) {
                        continue;
                    }
                    match state.locks.get(key) {
                        Some(owner) if *owner != self.id => contended = true,
                        _ => {
                            chosen = Some(row.clone());
                            break;
                        }
                    }
                }

                if let Some(row) = chosen {
                    let key = row.key();
                    if state.locks.insert(key.clone(), self.id).is_none() {
                        drop(state);
                        self.hold(&table, key);
                    }
                    return Ok(Some(row));
                }
                if !contended {
                    return Ok(None);
                }
            }

            trace!(tx = self.id, table = R::TABLE, "All candidates locked, waiting");
            released.await;
        }
    }

    async fn lock<R: Record>(&mut self, key: &R::Key) -> Result<Option<R>, StoreError> {
        let table = self.db.table::<R>()?;
        loop {
            let released = table.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = table.state();
                let Some(row) = state.rows.get(key).cloned() else {
                    return Ok(None);
                };
                match state.locks.get(key) {
                    Some(owner) if *owner != self.id => {}
                    Some(_) => return Ok(Some(row)),
                    None => {
                        state.locks.insert(key.clone(), self.id);
                        drop(state);
                        self.hold(&table, key.clone());
                        return Ok(Some(row));
                    }
                }
            }

            trace!(tx = self.id, table = R::TABLE, key = ?key, "Row locked, waiting");
            released.await;
        }
    }

    fn get<R: Record>(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        Ok(self.db.table::<R>()?.state().rows.get(key).cloned())
    }

    fn find<R, F>(&self, filter: F) -> Result<Option<R>, StoreError>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        let table = self.db.table::<R>()?;
        let state = table.state();
        Ok(state.rows.values().find(|row| filter(row)).cloned())
    }

    fn filter<R, F>(&self, filter: F) -> Result<Vec<R>, StoreError>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        let table = self.db.table::<R>()?;
        let state = table.state();
        Ok(state.rows.values().filter(|row| filter(row)).cloned().collect())
    }

    fn count<R: Record>(&self) -> Result<usize, StoreError> {
        Ok(self.db.table::<R>()?.state().rows.len())
    }

    fn insert<R: Record>(&mut self, mut row: R) -> Result<R, StoreError> {
        let sequence = self.db.table::<R>()?.next_sequence();
        row.assign_key(sequence);
        self.changeset::<R>()?.insert(row.clone());
        Ok(row)
    }

    fn update<R: Record>(&mut self, row: R) -> Result<(), StoreError> {
        self.changeset::<R>()?.update(row);
        Ok(())
    }

    fn delete<R: Record>(&mut self, key: &R::Key) -> Result<(), StoreError> {
        self.changeset::<R>()?.delete(key.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let staged = std::mem::take(&mut self.staged);
        let result = {
            let _gate = self.db.commit_gate.lock().await;
            match staged.iter().try_for_each(|writes| writes.validate()) {
                Ok(()) => {
                    for writes in &staged {
                        writes.apply();
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        match &result {
            Ok(()) => trace!(tx = self.id, "Transaction committed"),
            Err(e) => debug!(tx = self.id, error = %e, "Commit rejected, rolling back"),
        }
        self.release_locks();
        result
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        trace!(tx = self.id, "Transaction rolled back");
        self.staged.clear();
        self.release_locks();
        Ok(())
    }
}
