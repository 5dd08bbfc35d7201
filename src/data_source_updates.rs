//! The update propagation engine: writes data received from the active data source into the data
//! store, tracks dependencies between items, notifies about changed flags, and owns the status
//! seen by the application.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Condvar, Mutex, RwLock},
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    data_store::{DataStore, StoreError},
    dependency_tracker::DependencyTracker,
    status::same_error,
    ChangeSet, ChangeSetType, DataKind, DataSourceState, DataSourceStatus, DataSourceUpdates,
    ErrorInfo, ErrorKind, FullDataSet, ItemDescriptor, KindAndKey, Selector,
};

/// Identical store errors are logged at `warn` level at most once per this interval.
const STORE_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Notification that the configuration of a flag may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChangeEvent {
    pub key: String,
}

/// Receives [`FlagChangeEvent`]s.
pub trait FlagChangeListener: Send + Sync {
    fn flag_changed(&self, event: &FlagChangeEvent);
}

impl<T: Fn(&FlagChangeEvent) + Send + Sync> FlagChangeListener for T {
    fn flag_changed(&self, event: &FlagChangeEvent) {
        self(event);
    }
}

/// Receives data source status changes.
pub trait StatusListener: Send + Sync {
    fn status_changed(&self, status: &DataSourceStatus);
}

impl<T: Fn(&DataSourceStatus) + Send + Sync> StatusListener for T {
    fn status_changed(&self, status: &DataSourceStatus) {
        self(status);
    }
}

/// Receives data from whichever data source is currently active and propagates it to the data
/// store and listeners.
///
/// Never retries a failed write. Store failures are reported as
/// [`DataSourceState::Interrupted`] with [`ErrorKind::StoreError`], and the data source is
/// expected to resend the data (e.g., after reconnecting).
pub struct DataSourceUpdatesImpl {
    store: Arc<dyn DataStore>,
    dependencies: Mutex<DependencyTracker>,
    status: Arc<(Mutex<DataSourceStatus>, Condvar)>,
    selector: RwLock<Selector>,
    flag_listeners: RwLock<Vec<Arc<dyn FlagChangeListener>>>,
    status_listeners: RwLock<Vec<Arc<dyn StatusListener>>>,
    last_store_error: Mutex<Option<(String, Instant)>>,
}

impl DataSourceUpdatesImpl {
    pub fn new(store: Arc<dyn DataStore>) -> DataSourceUpdatesImpl {
        let selector = store
            .transactional()
            .map(|store| store.selector())
            .unwrap_or_default();

        DataSourceUpdatesImpl {
            store,
            dependencies: Mutex::new(DependencyTracker::new()),
            status: Arc::new((Mutex::new(DataSourceStatus::initializing()), Condvar::new())),
            selector: RwLock::new(selector),
            flag_listeners: RwLock::new(Vec::new()),
            status_listeners: RwLock::new(Vec::new()),
            last_store_error: Mutex::new(None),
        }
    }

    pub fn add_flag_change_listener(&self, listener: impl FlagChangeListener + 'static) {
        self.flag_listeners
            .write()
            .expect("thread holding listeners lock should not panic")
            .push(Arc::new(listener));
    }

    pub fn add_status_listener(&self, listener: impl StatusListener + 'static) {
        self.status_listeners
            .write()
            .expect("thread holding listeners lock should not panic")
            .push(Arc::new(listener));
    }

    /// Current status of the data source.
    pub fn status(&self) -> DataSourceStatus {
        self.status
            .0
            .lock()
            .expect("thread holding status lock should not panic")
            .clone()
    }

    /// Returns `true` once the data store holds a full data set.
    pub fn initialized(&self) -> bool {
        self.store.initialized()
    }

    /// Block until the status reaches `desired_state` or `timeout` elapses.
    ///
    /// Returns `true` if the desired state was reached. Returns `false` early if the status turns
    /// `Off` (unless `Off` is the desired state), as nothing will change after that.
    pub fn wait_for(&self, desired_state: DataSourceState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self
            .status
            .0
            .lock()
            .expect("thread holding status lock should not panic");
        loop {
            if status.state == desired_state {
                return true;
            }
            if status.state == DataSourceState::Off {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = self
                .status
                .1
                .wait_timeout(status, deadline - now)
                .expect("thread holding status lock should not panic")
                .0;
        }
    }

    fn has_flag_listeners(&self) -> bool {
        !self
            .flag_listeners
            .read()
            .expect("thread holding listeners lock should not panic")
            .is_empty()
    }

    fn snapshot(&self) -> Result<FullDataSet, StoreError> {
        DataKind::ALL
            .iter()
            .map(|kind| Ok((*kind, self.store.get_all(*kind)?)))
            .collect()
    }

    /// Replace all data. Returns items whose version changed.
    fn init_inner(&self, data: FullDataSet) -> Result<Vec<KindAndKey>, StoreError> {
        let previous = if self.has_flag_listeners() {
            Some(self.snapshot()?)
        } else {
            None
        };

        self.store.init(data.clone())?;
        self.rebuild_dependencies(&data);

        Ok(previous
            .map(|previous| changed_items(&previous, &data))
            .unwrap_or_default())
    }

    /// Apply a full change set through a transactional store.
    fn apply_full_inner(&self, change_set: &ChangeSet) -> Result<Vec<KindAndKey>, StoreError> {
        let Some(transactional) = self.store.transactional() else {
            return self.init_inner(change_set.to_full_data_set());
        };

        let previous = if self.has_flag_listeners() {
            Some(self.snapshot()?)
        } else {
            None
        };

        transactional.apply(change_set)?;
        let data = change_set.to_full_data_set();
        self.rebuild_dependencies(&data);

        Ok(previous
            .map(|previous| changed_items(&previous, &data))
            .unwrap_or_default())
    }

    /// Apply a partial change set. Returns items that have been updated.
    fn apply_partial_inner(&self, change_set: &ChangeSet) -> Result<Vec<KindAndKey>, StoreError> {
        let Some(transactional) = self.store.transactional() else {
            // The store cannot apply change sets, so decompose into individual upserts.
            let mut changed = Vec::new();
            for change in change_set.changes() {
                let updated =
                    self.upsert_inner(change.kind(), change.key(), change.to_descriptor())?;
                changed.extend(updated);
            }
            return Ok(changed);
        };

        let mut previous_versions = BTreeMap::new();
        for change in change_set.changes() {
            let item = KindAndKey::new(change.kind(), change.key());
            if !previous_versions.contains_key(&item) {
                let version = self
                    .store
                    .get(change.kind(), change.key())?
                    .map(|item| item.version);
                previous_versions.insert(item, version);
            }
        }

        transactional.apply(change_set)?;

        let mut dependencies = self
            .dependencies
            .lock()
            .expect("thread holding dependencies lock should not panic");
        let mut changed = Vec::new();
        for change in change_set.changes() {
            let item = KindAndKey::new(change.kind(), change.key());
            // Versions only grow, so a strictly greater version is the only evidence of a change.
            let is_newer = match previous_versions.get(&item).copied().flatten() {
                Some(previous) => change.version() > previous,
                None => true,
            };
            if is_newer {
                dependencies.update_dependencies_from(&item, change.object());
                previous_versions.insert(item.clone(), Some(change.version()));
                changed.push(item);
            }
        }
        Ok(changed)
    }

    /// Upsert a single item. Returns the item if it has been updated.
    fn upsert_inner(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<Option<KindAndKey>, StoreError> {
        let object = item.item.clone();
        if !self.store.upsert(kind, key, item)? {
            return Ok(None);
        }

        let kind_and_key = KindAndKey::new(kind, key);
        self.dependencies
            .lock()
            .expect("thread holding dependencies lock should not panic")
            .update_dependencies_from(&kind_and_key, object.as_deref());
        Ok(Some(kind_and_key))
    }

    fn rebuild_dependencies(&self, data: &FullDataSet) {
        let mut dependencies = self
            .dependencies
            .lock()
            .expect("thread holding dependencies lock should not panic");
        dependencies.reset();
        for (kind, items) in data {
            for (key, item) in items {
                dependencies
                    .update_dependencies_from(&KindAndKey::new(*kind, key), item.item.as_deref());
            }
        }
    }

    /// Common tail of every data method: report the outcome and notify listeners.
    fn finish_update(
        &self,
        result: Result<Vec<KindAndKey>, StoreError>,
        selector: Option<&Selector>,
    ) -> bool {
        let changed = match result {
            Ok(changed) => changed,
            Err(err) => {
                self.report_store_failure(&err);
                return false;
            }
        };

        if let Some(selector) = selector.filter(|selector| !selector.is_empty()) {
            *self
                .selector
                .write()
                .expect("thread holding selector lock should not panic") = selector.clone();
        }

        self.update_status(DataSourceState::Valid, None);
        self.send_change_events(&changed);
        true
    }

    fn send_change_events(&self, changed: &[KindAndKey]) {
        if changed.is_empty() || !self.has_flag_listeners() {
            return;
        }

        let mut affected = BTreeSet::new();
        {
            let dependencies = self
                .dependencies
                .lock()
                .expect("thread holding dependencies lock should not panic");
            for item in changed {
                dependencies.add_affected_items(&mut affected, item);
            }
        }

        let listeners = self
            .flag_listeners
            .read()
            .expect("thread holding listeners lock should not panic")
            .clone();
        for item in affected.into_iter().filter(|item| item.kind == DataKind::Flag) {
            log::trace!(target: "eppo", key = item.key.as_str(); "flag changed");
            let event = FlagChangeEvent { key: item.key };
            for listener in &listeners {
                listener.flag_changed(&event);
            }
        }
    }

    fn report_store_failure(&self, err: &StoreError) {
        {
            let mut last = self
                .last_store_error
                .lock()
                .expect("thread holding store error lock should not panic");
            let now = Instant::now();
            let is_repeat = matches!(&*last, Some((message, at))
                if message == err.message() && now.duration_since(*at) < STORE_ERROR_LOG_INTERVAL);
            if is_repeat {
                log::debug!(target: "eppo", "data store update failed again: {err}");
            } else {
                log::warn!(
                    target: "eppo",
                    "failed to update data store, waiting for data source to resend data: {err}"
                );
                *last = Some((err.message().to_owned(), now));
            }
        }

        self.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::new(ErrorKind::StoreError, err.message())),
        );
    }
}

impl DataSourceUpdates for DataSourceUpdatesImpl {
    fn init(&self, data: FullDataSet) -> bool {
        let result = self.init_inner(data);
        self.finish_update(result, None)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        let result = self
            .upsert_inner(kind, key, item)
            .map(|item| item.into_iter().collect());
        self.finish_update(result, None)
    }

    fn apply(&self, change_set: ChangeSet) -> bool {
        let result = match change_set.change_set_type() {
            // Nothing to write. Only the selector may move.
            ChangeSetType::None => Ok(Vec::new()),
            ChangeSetType::Full => self.apply_full_inner(&change_set),
            ChangeSetType::Partial => self.apply_partial_inner(&change_set),
        };
        self.finish_update(result, Some(change_set.selector()))
    }

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let status = {
            let mut status = self
                .status
                .0
                .lock()
                .expect("thread holding status lock should not panic");

            // Once interrupted, the data source keeps reporting `Interrupted` until it recovers,
            // even if it goes through initialization again while reconnecting.
            let state = match (state, status.state) {
                (DataSourceState::Initializing, DataSourceState::Interrupted) => {
                    DataSourceState::Interrupted
                }
                (state, _) => state,
            };

            if state == status.state
                && (error.is_none() || same_error(error.as_ref(), status.last_error.as_ref()))
            {
                return;
            }

            let since = if state == status.state {
                status.since
            } else {
                Utc::now()
            };
            *status = DataSourceStatus {
                state,
                since,
                last_error: error.or_else(|| status.last_error.take()),
            };
            self.status.1.notify_all();
            status.clone()
        };

        log::debug!(target: "eppo", "data source status changed to {:?}", status.state);
        let listeners = self
            .status_listeners
            .read()
            .expect("thread holding listeners lock should not panic")
            .clone();
        for listener in &listeners {
            listener.status_changed(&status);
        }
    }
    fn selector(&self) -> Selector {
        self.selector
            .read()
            .expect("thread holding selector lock should not panic")
            .clone()
    }
}

/// Items whose version differs between `previous` and `current`, including items that were added
/// or removed.
fn changed_items(previous: &FullDataSet, current: &FullDataSet) -> Vec<KindAndKey> {
    let empty = BTreeMap::new();
    let mut changed = Vec::new();
    for kind in DataKind::ALL {
        let old = previous.get(&kind).unwrap_or(&empty);
        let new = current.get(&kind).unwrap_or(&empty);
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for key in keys {
            let old_version = old.get(key).map(|item| item.version);
            let new_version = new.get(key).map(|item| item.version);
            if old_version != new_version {
                changed.push(KindAndKey::new(kind, key.as_str()));
            }
        }
    }
    changed
}
