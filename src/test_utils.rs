//! Helpers shared by unit tests.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    data_store::{DataStore, InMemoryDataStore, StoreError},
    ChangeSet, DataKind, DataSourceState, DataSourceUpdates, ErrorInfo, FullDataSet,
    ItemDescriptor, Selector,
};

/// A call received by [`RecordingUpdates`].
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Init(FullDataSet),
    Upsert(DataKind, String, ItemDescriptor),
    Apply(ChangeSet),
    Status(DataSourceState, Option<ErrorInfo>),
}

/// A sink that records every call and reports data as stored.
#[derive(Debug, Default)]
pub struct RecordingUpdates {
    calls: Mutex<Vec<Recorded>>,
    reject_data: AtomicBool,
}

impl RecordingUpdates {
    pub fn new() -> RecordingUpdates {
        RecordingUpdates::default()
    }

    /// Make data methods return `false` from now on.
    pub fn reject_data(&self, reject: bool) {
        self.reject_data.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<(DataSourceState, Option<ErrorInfo>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Recorded::Status(state, error) => Some((state, error)),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<DataSourceState> {
        self.statuses().into_iter().map(|(state, _)| state).collect()
    }

    pub fn change_sets(&self) -> Vec<ChangeSet> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Recorded::Apply(change_set) => Some(change_set),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Recorded) -> bool {
        self.calls.lock().unwrap().push(call);
        !self.reject_data.load(Ordering::SeqCst)
    }
}

impl DataSourceUpdates for RecordingUpdates {
    fn init(&self, data: FullDataSet) -> bool {
        self.record(Recorded::Init(data))
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        self.record(Recorded::Upsert(kind, key.to_owned(), item))
    }

    fn apply(&self, change_set: ChangeSet) -> bool {
        self.record(Recorded::Apply(change_set))
    }

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        self.calls.lock().unwrap().push(Recorded::Status(state, error));
    }

    /// Selector of the last applied change set that carried one.
    fn selector(&self) -> Selector {
        self.change_sets()
            .iter()
            .rev()
            .map(|change_set| change_set.selector())
            .find(|selector| !selector.is_empty())
            .cloned()
            .unwrap_or_default()
    }
}

/// A non-transactional store that can be switched into failing every operation.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryDataStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> FlakyStore {
        FlakyStore::default()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::new("disk on fire"))
        } else {
            Ok(())
        }
    }
}

impl DataStore for FlakyStore {
    fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
        self.check()?;
        self.inner.init(data)
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        self.check()?;
        self.inner.get(kind, key)
    }

    fn get_all(&self, kind: DataKind) -> Result<BTreeMap<String, ItemDescriptor>, StoreError> {
        self.check()?;
        self.inner.get_all(kind)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.upsert(kind, key, item)
    }

    fn initialized(&self) -> bool {
        self.inner.initialized()
    }
}

/// Poll `condition` until it returns `true` or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
