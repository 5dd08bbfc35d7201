//! The storage collaborator contract and a thread-safe in-memory implementation.
//!
//! The update propagation engine is the only component that writes to a [`DataStore`]. Readers
//! (e.g., flag evaluation) may access the store concurrently.
use std::{collections::BTreeMap, sync::RwLock};

use crate::{ChangeSet, ChangeSetType, DataKind, FullDataSet, ItemDescriptor, Selector};

/// Error returned by a data store when it failed to read or persist data.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("data store error: {message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> StoreError {
        StoreError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Narrow read/write contract consumed by the update propagation engine.
pub trait DataStore: Send + Sync {
    /// Replace all data in the store and mark it as initialized.
    fn init(&self, data: FullDataSet) -> Result<(), StoreError>;

    /// Get an item, including deletion tombstones.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError>;

    /// Get all items of the given kind, including deletion tombstones.
    fn get_all(&self, kind: DataKind) -> Result<BTreeMap<String, ItemDescriptor>, StoreError>;

    /// Insert or update an item if `item.version` is greater than the stored version.
    ///
    /// Returns `Ok(true)` if the item was written and `Ok(false)` if it was ignored as stale.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool, StoreError>;

    /// Returns `true` once the store has been initialized with a full data set.
    fn initialized(&self) -> bool;

    /// Returns the transactional interface if the store can apply change sets atomically.
    fn transactional(&self) -> Option<&dyn TransactionalDataStore> {
        None
    }
}

/// A store that applies whole change sets atomically and remembers the selector of the data it
/// holds.
pub trait TransactionalDataStore: Send + Sync {
    fn apply(&self, change_set: &ChangeSet) -> Result<(), StoreError>;

    fn selector(&self) -> Selector;
}

#[derive(Debug, Default)]
struct StoreState {
    data: FullDataSet,
    initialized: bool,
    selector: Selector,
}

impl StoreState {
    fn upsert(&mut self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        let items = self.data.entry(kind).or_default();
        match items.get(key) {
            Some(existing) if existing.version >= item.version => false,
            _ => {
                items.insert(key.to_owned(), item);
                true
            }
        }
    }
}

/// `InMemoryDataStore` provides a thread-safe (`Sync`) storage that allows concurrent access for
/// readers and writers.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    state: RwLock<StoreState>,
}

impl InMemoryDataStore {
    /// Create a new empty, uninitialized store.
    pub fn new() -> InMemoryDataStore {
        InMemoryDataStore::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .expect("thread holding data store lock should not panic");
        state.data = data;
        state.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        // self.state.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        let state = self
            .state
            .read()
            .expect("thread holding data store lock should not panic");
        Ok(state.data.get(&kind).and_then(|items| items.get(key)).cloned())
    }

    fn get_all(&self, kind: DataKind) -> Result<BTreeMap<String, ItemDescriptor>, StoreError> {
        let state = self
            .state
            .read()
            .expect("thread holding data store lock should not panic");
        Ok(state.data.get(&kind).cloned().unwrap_or_default())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool, StoreError> {
        let mut state = self
            .state
            .write()
            .expect("thread holding data store lock should not panic");
        Ok(state.upsert(kind, key, item))
    }

    fn initialized(&self) -> bool {
        self.state
            .read()
            .expect("thread holding data store lock should not panic")
            .initialized
    }

    fn transactional(&self) -> Option<&dyn TransactionalDataStore> {
        Some(self)
    }
}

impl TransactionalDataStore for InMemoryDataStore {
    fn apply(&self, change_set: &ChangeSet) -> Result<(), StoreError> {
        // Constructing new data before requesting the lock to minimize lock span.
        let full = match change_set.change_set_type() {
            ChangeSetType::Full => Some(change_set.to_full_data_set()),
            ChangeSetType::Partial | ChangeSetType::None => None,
        };

        let mut state = self
            .state
            .write()
            .expect("thread holding data store lock should not panic");
        match full {
            Some(data) => {
                state.data = data;
                state.initialized = true;
            }
            None => {
                for change in change_set.changes() {
                    state.upsert(change.kind(), change.key(), change.to_descriptor());
                }
            }
        }
        if !change_set.selector().is_empty() {
            state.selector = change_set.selector().clone();
        }
        Ok(())
    }

    fn selector(&self) -> Selector {
        self.state
            .read()
            .expect("thread holding data store lock should not panic")
            .selector
            .clone()
    }
}
