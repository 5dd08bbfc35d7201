//! Wires initializers, synchronizers, the update propagation engine and initialization tracking
//! into a single component.
use std::{sync::Arc, time::Duration};

use crate::{
    composite::{CompositeSource, CompositeSourceConfig, PolicyKind, TimedFallbackConfig},
    data_source_updates::{DataSourceUpdatesImpl, FlagChangeListener, StatusListener},
    data_store::DataStore,
    init_tracker::InitTracker,
    Completion, DataSource, DataSourceFactory, DataSourceState, DataSourceStatus,
    DataSourceUpdates,
};

/// Configuration for [`DataSystem`].
///
/// Initializers are tried in order until one of them delivers data. Synchronizers then keep the
/// data up to date. The first synchronizer is the primary one. Others are only used while it is
/// failing, and the data system returns to the primary synchronizer once it has been healthy for
/// a while.
#[derive(Clone, Default)]
pub struct DataSystemConfig {
    initializers: Vec<Arc<dyn DataSourceFactory>>,
    synchronizers: Vec<Arc<dyn DataSourceFactory>>,
    timed_fallback: TimedFallbackConfig,
}

impl DataSystemConfig {
    pub fn new() -> DataSystemConfig {
        DataSystemConfig::default()
    }

    /// Append an initializer.
    pub fn with_initializer(mut self, factory: impl DataSourceFactory + 'static) -> Self {
        self.initializers.push(Arc::new(factory));
        self
    }

    /// Append a synchronizer.
    pub fn with_synchronizer(mut self, factory: impl DataSourceFactory + 'static) -> Self {
        self.synchronizers.push(Arc::new(factory));
        self
    }

    /// How long a synchronizer may stay interrupted before the next one is tried.
    ///
    /// Defaults to [`TimedFallbackConfig::DEFAULT_FALLBACK_DELAY`].
    pub fn with_fallback_delay(mut self, delay: Duration) -> Self {
        self.timed_fallback = self.timed_fallback.with_fallback_delay(delay);
        self
    }

    /// How long a secondary synchronizer must be healthy before the primary one is tried again.
    ///
    /// Defaults to [`TimedFallbackConfig::DEFAULT_RECOVERY_DELAY`].
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.timed_fallback = self.timed_fallback.with_recovery_delay(delay);
        self
    }

    fn has_sources(&self) -> bool {
        !self.initializers.is_empty() || !self.synchronizers.is_empty()
    }
}

/// Keeps a [`DataStore`] synchronized with the service.
///
/// The data sources are supervised by a circular [`CompositeSource`]:
///
/// ```text
/// [initializers (run once, in order), synchronizer 1, synchronizer 2, ...]
/// ```
///
/// The initializer tier is removed as soon as it delivers data or runs out of initializers.
/// Synchronizers fall back to the next one after being interrupted for too long and are removed
/// if they fail permanently. The data system turns off once no source is left.
pub struct DataSystem {
    store: Arc<dyn DataStore>,
    updates: Arc<DataSourceUpdatesImpl>,
    tracker: Arc<InitTracker>,
    source: Option<CompositeSource>,
}

impl DataSystem {
    pub fn new(config: DataSystemConfig, store: Arc<dyn DataStore>) -> DataSystem {
        let updates = Arc::new(DataSourceUpdatesImpl::new(store.clone()));

        if !config.has_sources() {
            log::info!(target: "eppo", "no data sources configured, serving data from the store");
            return DataSystem {
                store,
                tracker: Arc::new(InitTracker::initialized(updates.clone())),
                updates,
                source: None,
            };
        }

        let tracker = Arc::new(InitTracker::new(updates.clone()));

        let mut sources = CompositeSourceConfig::new()
            .with_circular(true)
            .with_timed_fallback(config.timed_fallback);
        if config.initializers.is_empty() {
            tracker.initializers_exhausted();
        } else {
            let initializers = config
                .initializers
                .into_iter()
                .fold(CompositeSourceConfig::new(), |tier, factory| {
                    tier.with_shared_source(factory, PolicyKind::FailFast)
                });
            sources = sources.with_source(
                InitializerTierFactory {
                    initializers,
                    tracker: tracker.clone(),
                },
                PolicyKind::BlacklistOnSuccessOrOff,
            );
        }
        for factory in config.synchronizers {
            sources = sources.with_shared_source(factory, PolicyKind::TimedFallback);
        }

        let source = CompositeSource::new(sources, tracker.clone());
        DataSystem {
            store,
            updates,
            tracker,
            source: Some(source),
        }
    }

    /// Start acquiring data.
    ///
    /// The returned completion resolves to `true` once the SDK is initialized and to `false` if
    /// all data sources failed before that.
    pub fn start(&self) -> Completion {
        if let Some(source) = &self.source {
            source.start();
        }
        self.tracker.completion()
    }

    /// The store data is written to.
    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn status(&self) -> DataSourceStatus {
        self.updates.status()
    }

    /// Returns `true` once the store holds a full data set.
    pub fn initialized(&self) -> bool {
        self.updates.initialized()
    }

    /// Block until the status reaches `desired_state` or `timeout` elapses. See
    /// [`DataSourceUpdatesImpl::wait_for`].
    pub fn wait_for(&self, desired_state: DataSourceState, timeout: Duration) -> bool {
        self.updates.wait_for(desired_state, timeout)
    }

    pub fn add_flag_change_listener(&self, listener: impl FlagChangeListener + 'static) {
        self.updates.add_flag_change_listener(listener);
    }

    pub fn add_status_listener(&self, listener: impl StatusListener + 'static) {
        self.updates.add_status_listener(listener);
    }

    /// Stop all data sources and report [`DataSourceState::Off`]. Idempotent.
    pub fn dispose(&self) {
        if let Some(source) = &self.source {
            source.dispose();
        }
        self.tracker.update_status(DataSourceState::Off, None);
    }
}

/// Creates the initializer tier: a non-circular composite of initializers that marks
/// initializers as exhausted when it goes away.
struct InitializerTierFactory {
    initializers: CompositeSourceConfig,
    tracker: Arc<InitTracker>,
}

impl DataSourceFactory for InitializerTierFactory {
    fn create(&self, updates: Arc<dyn DataSourceUpdates>) -> Arc<dyn DataSource> {
        Arc::new(InitializerTier {
            source: CompositeSource::new(self.initializers.clone(), updates),
            tracker: self.tracker.clone(),
        })
    }
}

struct InitializerTier {
    source: CompositeSource,
    tracker: Arc<InitTracker>,
}

impl DataSource for InitializerTier {
    fn start(&self) -> Completion {
        self.source.start()
    }

    /// The tier is disposed once it has delivered data or failed. Either way, no initializer
    /// runs after that.
    fn dispose(&self) {
        self.source.dispose();
        self.tracker.initializers_exhausted();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use serde_json::json;

    use super::{DataSystem, DataSystemConfig};
    use crate::{
        data_source_updates::FlagChangeEvent,
        data_store::{DataStore, InMemoryDataStore},
        test_utils::wait_until,
        Change, ChangeSet, Completion, DataKind, DataSource, DataSourceFactory, DataSourceState,
        DataSourceUpdates, ErrorInfo, Selector,
    };

    #[derive(Debug, Clone)]
    enum Behavior {
        /// Apply the change set and report `Valid`.
        Deliver(ChangeSet),
        /// Report `Off` with a 401.
        Fail,
    }

    struct FixedSource {
        behavior: Behavior,
        updates: Arc<dyn DataSourceUpdates>,
        disposed: Arc<AtomicBool>,
    }

    impl DataSource for FixedSource {
        fn start(&self) -> Completion {
            match &self.behavior {
                Behavior::Deliver(change_set) => {
                    self.updates.apply(change_set.clone());
                    self.updates.update_status(DataSourceState::Valid, None);
                }
                Behavior::Fail => self.updates.update_status(
                    DataSourceState::Off,
                    Some(ErrorInfo::from_status_code(401)),
                ),
            }
            Completion::new()
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct FixedFactory {
        behavior: Behavior,
        created: AtomicUsize,
        disposed: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FixedFactory {
        fn new(behavior: Behavior) -> Arc<FixedFactory> {
            Arc::new(FixedFactory {
                behavior,
                created: AtomicUsize::new(0),
                disposed: Mutex::new(Vec::new()),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn all_disposed(&self) -> bool {
            self.disposed
                .lock()
                .unwrap()
                .iter()
                .all(|disposed| disposed.load(Ordering::SeqCst))
        }
    }

    impl DataSourceFactory for FixedFactory {
        fn create(&self, updates: Arc<dyn DataSourceUpdates>) -> Arc<dyn DataSource> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let disposed = Arc::new(AtomicBool::new(false));
            self.disposed.lock().unwrap().push(disposed.clone());
            Arc::new(FixedSource {
                behavior: self.behavior.clone(),
                updates,
                disposed,
            })
        }
    }

    /// Lets tests keep a handle on a factory after moving it into the config.
    fn shared(factory: &Arc<FixedFactory>) -> impl DataSourceFactory {
        let factory = factory.clone();
        move |updates: Arc<dyn DataSourceUpdates>| -> Arc<dyn DataSource> {
            factory.create(updates)
        }
    }

    fn flag_data(selector: Selector) -> Behavior {
        Behavior::Deliver(ChangeSet::full(
            vec![Change::put(
                DataKind::Flag,
                "flag",
                1,
                json!({"key": "flag", "version": 1}),
            )],
            selector,
        ))
    }

    fn store() -> Arc<InMemoryDataStore> {
        Arc::new(InMemoryDataStore::new())
    }

    #[test]
    fn initializer_with_selector_initializes_and_hands_over() {
        let _ = env_logger::builder().is_test(true).try_init();

        let initializer = FixedFactory::new(flag_data(Selector::new(1, "p:1")));
        let synchronizer = FixedFactory::new(flag_data(Selector::new(2, "p:2")));
        let store = store();
        let system = DataSystem::new(
            DataSystemConfig::new()
                .with_initializer(shared(&initializer))
                .with_synchronizer(shared(&synchronizer)),
            store.clone(),
        );

        let completion = system.start();

        assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Some(true));
        assert!(system.wait_for(DataSourceState::Valid, Duration::from_secs(5)));
        assert!(wait_until(Duration::from_secs(5), || {
            synchronizer.created() == 1
        }));
        assert_eq!(initializer.created(), 1);
        assert!(initializer.all_disposed());
        assert!(system.initialized());
        assert!(store.get(DataKind::Flag, "flag").unwrap().is_some());
    }

    #[test]
    fn initializer_without_selector_initializes_once_tier_is_done() {
        let initializer = FixedFactory::new(flag_data(Selector::empty()));
        let system = DataSystem::new(
            DataSystemConfig::new().with_initializer(shared(&initializer)),
            store(),
        );

        let completion = system.start();

        assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Some(true));
        assert!(initializer.all_disposed());
    }

    #[test]
    fn failing_initializers_fall_through_to_synchronizer() {
        let first = FixedFactory::new(Behavior::Fail);
        let second = FixedFactory::new(Behavior::Fail);
        let synchronizer = FixedFactory::new(flag_data(Selector::new(1, "p:1")));
        let system = DataSystem::new(
            DataSystemConfig::new()
                .with_initializer(shared(&first))
                .with_initializer(shared(&second))
                .with_synchronizer(shared(&synchronizer)),
            store(),
        );

        let completion = system.start();

        assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Some(true));
        assert_eq!(first.created(), 1);
        assert_eq!(second.created(), 1);
        assert_eq!(synchronizer.created(), 1);
    }

    #[test]
    fn everything_failing_turns_off() {
        let initializer = FixedFactory::new(Behavior::Fail);
        let synchronizer = FixedFactory::new(Behavior::Fail);
        let system = DataSystem::new(
            DataSystemConfig::new()
                .with_initializer(shared(&initializer))
                .with_synchronizer(shared(&synchronizer)),
            store(),
        );

        let completion = system.start();

        assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Some(false));
        assert!(system.wait_for(DataSourceState::Off, Duration::from_secs(5)));
        assert_eq!(synchronizer.created(), 1);
        assert!(synchronizer.all_disposed());
    }

    #[test]
    fn no_sources_is_initialized_immediately() {
        let system = DataSystem::new(DataSystemConfig::new(), store());

        assert_eq!(system.start().value(), Some(true));
    }

    #[test]
    fn synchronizer_data_notifies_flag_listeners() {
        let synchronizer = FixedFactory::new(flag_data(Selector::new(1, "p:1")));
        let system = DataSystem::new(
            DataSystemConfig::new().with_synchronizer(shared(&synchronizer)),
            store(),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        system.add_flag_change_listener(move |event: &FlagChangeEvent| {
            recorded.lock().unwrap().push(event.key.clone());
        });

        assert_eq!(
            system.start().wait_timeout(Duration::from_secs(5)),
            Some(true)
        );

        assert_eq!(*events.lock().unwrap(), vec!["flag".to_owned()]);
    }

    #[test]
    fn dispose_turns_off() {
        let synchronizer = FixedFactory::new(flag_data(Selector::new(1, "p:1")));
        let system = DataSystem::new(
            DataSystemConfig::new().with_synchronizer(shared(&synchronizer)),
            store(),
        );
        system
            .start()
            .wait_timeout(Duration::from_secs(5))
            .unwrap();

        system.dispose();
        system.dispose();

        assert_eq!(system.status().state, DataSourceState::Off);
        assert!(synchronizer.all_disposed());
    }
}
