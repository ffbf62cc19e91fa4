//! Table state for the in-memory engine

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::Notify;

use crate::error::StoreError;
use crate::store_trait::Record;

/// Transaction identifier, unique per engine
pub(crate) type TxId = u64;

/// Rows of one record type plus the row locks held on them
pub(crate) struct Table<R: Record> {
    state: Mutex<TableState<R>>,
    /// Woken whenever a row lock is released
    pub(crate) released: Notify,
    sequence: AtomicU64,
}

pub(crate) struct TableState<R: Record> {
    pub(crate) rows: BTreeMap<R::Key, R>,
    /// unique key -> primary key
    unique: HashMap<String, R::Key>,
    /// primary key -> owning transaction
    pub(crate) locks: HashMap<R::Key, TxId>,
}

impl<R: Record> Table<R> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                rows: BTreeMap::new(),
                unique: HashMap::new(),
                locks: HashMap::new(),
            }),
            released: Notify::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Lock the table's bookkeeping. Critical sections never await, so a
    /// poisoned mutex still holds consistent state.
    pub(crate) fn state(&self) -> MutexGuard<'_, TableState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop `tx`'s lock on `key` and wake waiters
    pub(crate) fn unlock(&self, key: &R::Key, tx: TxId) {
        {
            let mut state = self.state();
            if state.locks.get(key) == Some(&tx) {
                state.locks.remove(key);
            }
        }
        self.released.notify_waiters();
    }
}

/// Type-erased row lock owned by a transaction
pub(crate) trait HeldLock: Send + Sync {
    fn release(&self, tx: TxId);
}

pub(crate) struct RowLock<R: Record> {
    pub(crate) table: Arc<Table<R>>,
    pub(crate) key: R::Key,
}

impl<R: Record> HeldLock for RowLock<R> {
    fn release(&self, tx: TxId) {
        self.table.unlock(&self.key, tx);
    }
}

enum Write<R: Record> {
    Insert(R),
    Update(R),
    Delete(R::Key),
}

/// Writes staged against one table, in the order they were made
pub(crate) struct Changeset<R: Record> {
    table: Arc<Table<R>>,
    writes: Vec<Write<R>>,
}

impl<R: Record> Changeset<R> {
    pub(crate) fn new(table: Arc<Table<R>>) -> Self {
        Self {
            table,
            writes: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, row: R) {
        self.writes.push(Write::Insert(row));
    }

    pub(crate) fn update(&mut self, row: R) {
        self.writes.push(Write::Update(row));
    }

    pub(crate) fn delete(&mut self, key: R::Key) {
        self.writes.push(Write::Delete(key));
    }
}

/// Type-erased [`Changeset`]
pub(crate) trait StagedWrites: Send + Sync {
    fn table_name(&self) -> &'static str;

    /// Replay the writes over the committed keys and fail on the first
    /// primary or unique key violation. Nothing is changed.
    fn validate(&self) -> Result<(), StoreError>;

    /// Apply all writes under a single table lock
    fn apply(&self);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<R: Record> StagedWrites for Changeset<R> {
    fn table_name(&self) -> &'static str {
        R::TABLE
    }

    fn validate(&self) -> Result<(), StoreError> {
        let state = self.table.state();
        let mut overlay = Overlay::<R>::default();

        for write in &self.writes {
            match write {
                Write::Insert(row) => {
                    let key = row.key();
                    if overlay.exists(&state, &key) {
                        return Err(StoreError::Conflict(format!(
                            "{} already has a row with key {:?}",
                            R::TABLE,
                            key
                        )));
                    }
                    overlay.claim_unique(&state, &key, row.unique_key())?;
                    overlay.present.insert(key, true);
                }
                Write::Update(row) => {
                    let key = row.key();
                    if !overlay.exists(&state, &key) {
                        return Err(StoreError::NotFound(format!(
                            "{} row {:?} not found",
                            R::TABLE,
                            key
                        )));
                    }
                    overlay.release_unique(&state, &key);
                    overlay.claim_unique(&state, &key, row.unique_key())?;
                }
                Write::Delete(key) => {
                    if !overlay.exists(&state, key) {
                        return Err(StoreError::NotFound(format!(
                            "{} row {:?} not found",
                            R::TABLE,
                            key
                        )));
                    }
                    overlay.release_unique(&state, key);
                    overlay.present.insert(key.clone(), false);
                }
            }
        }
        Ok(())
    }

    fn apply(&self) {
        let now = Utc::now();
        let mut state = self.table.state();
        for write in &self.writes {
            match write {
                Write::Insert(row) => {
                    let key = row.key();
                    if let Some(unique_key) = row.unique_key() {
                        state.unique.insert(unique_key, key.clone());
                    }
                    state.rows.insert(key, row.clone());
                }
                Write::Update(row) => {
                    let key = row.key();
                    if let Some(old) = state.rows.get(&key).and_then(R::unique_key) {
                        state.unique.remove(&old);
                    }
                    if let Some(unique_key) = row.unique_key() {
                        state.unique.insert(unique_key, key.clone());
                    }
                    let mut row = row.clone();
                    row.touch(now);
                    state.rows.insert(key, row);
                }
                Write::Delete(key) => {
                    if let Some(old) = state.rows.remove(key).as_ref().and_then(R::unique_key) {
                        state.unique.remove(&old);
                    }
                }
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Pending view of a table's keys while a changeset is validated
struct Overlay<R: Record> {
    /// primary key -> exists after the writes so far
    present: HashMap<R::Key, bool>,
    /// unique key -> owner after the writes so far
    owners: HashMap<String, Option<R::Key>>,
    /// primary key -> its unique key after the writes so far
    row_unique: HashMap<R::Key, Option<String>>,
}

impl<R: Record> Default for Overlay<R> {
    fn default() -> Self {
        Self {
            present: HashMap::new(),
            owners: HashMap::new(),
            row_unique: HashMap::new(),
        }
    }
}

impl<R: Record> Overlay<R> {
    fn exists(&self, state: &TableState<R>, key: &R::Key) -> bool {
        self.present
            .get(key)
            .copied()
            .unwrap_or_else(|| state.rows.contains_key(key))
    }

    fn owner(&self, state: &TableState<R>, unique_key: &str) -> Option<R::Key> {
        match self.owners.get(unique_key) {
            Some(owner) => owner.clone(),
            None => state.unique.get(unique_key).cloned(),
        }
    }

    fn release_unique(&mut self, state: &TableState<R>, key: &R::Key) {
        let current = match self.row_unique.get(key) {
            Some(current) => current.clone(),
            None => state.rows.get(key).and_then(R::unique_key),
        };
        if let Some(unique_key) = current {
            self.owners.insert(unique_key, None);
        }
        self.row_unique.insert(key.clone(), None);
    }

    fn claim_unique(
        &mut self,
        state: &TableState<R>,
        key: &R::Key,
        unique_key: Option<String>,
    ) -> Result<(), StoreError> {
        let Some(unique_key) = unique_key else {
            return Ok(());
        };
        if let Some(owner) = self.owner(state, &unique_key) {
            if owner != *key {
                return Err(StoreError::Conflict(format!(
                    "{} already has a row with address {}",
                    R::TABLE,
                    unique_key
                )));
            }
        }
        self.owners.insert(unique_key.clone(), Some(key.clone()));
        self.row_unique.insert(key.clone(), Some(unique_key));
        Ok(())
    }
}
