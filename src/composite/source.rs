use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use crate::{
    sanitizer::StatusSanitizer, ChangeSet, Completion, DataKind, DataSource, DataSourceFactory,
    DataSourceState, DataSourceUpdates, ErrorInfo, ErrorKind, FullDataSet, ItemDescriptor,
    Selector,
};

use super::{
    action_queue::{ActionQueue, QueuedAction},
    policy::{FailurePolicy, PolicyContext, PolicyKind, TimedFallbackConfig, Transition},
};

const EXHAUSTED_MESSAGE: &str = "composite source has exhausted all available sources";

#[derive(Clone)]
struct SourceEntry {
    /// Position of the entry in the configured list. Stable across blacklisting.
    id: usize,
    factory: Arc<dyn DataSourceFactory>,
    policy: PolicyKind,
}

/// Configuration for [`CompositeSource`].
///
/// A configuration is itself a [`DataSourceFactory`], so composites can be nested (e.g., a tier of
/// initializers used as a single entry of a larger composite).
#[derive(Clone, Default)]
pub struct CompositeSourceConfig {
    entries: Vec<SourceEntry>,
    circular: bool,
    timed_fallback: TimedFallbackConfig,
}

impl CompositeSourceConfig {
    /// Create an empty, non-circular configuration.
    pub fn new() -> CompositeSourceConfig {
        CompositeSourceConfig::default()
    }

    /// Append a source to the candidate list.
    pub fn with_source(
        self,
        factory: impl DataSourceFactory + 'static,
        policy: PolicyKind,
    ) -> CompositeSourceConfig {
        self.with_shared_source(Arc::new(factory), policy)
    }

    /// Append a shared source factory to the candidate list.
    pub fn with_shared_source(
        mut self,
        factory: Arc<dyn DataSourceFactory>,
        policy: PolicyKind,
    ) -> CompositeSourceConfig {
        self.entries.push(SourceEntry {
            id: self.entries.len(),
            factory,
            policy,
        });
        self
    }

    /// If `true`, moving past the last entry wraps around to the first one. Otherwise, the
    /// composite turns off once the last entry is done.
    pub fn with_circular(mut self, circular: bool) -> CompositeSourceConfig {
        self.circular = circular;
        self
    }

    /// Timings used by entries with [`PolicyKind::TimedFallback`].
    pub fn with_timed_fallback(mut self, config: TimedFallbackConfig) -> CompositeSourceConfig {
        self.timed_fallback = config;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DataSourceFactory for CompositeSourceConfig {
    fn create(&self, updates: Arc<dyn DataSourceUpdates>) -> Arc<dyn DataSource> {
        Arc::new(CompositeSource::new(self.clone(), updates))
    }
}

/// Supervises an ordered list of data sources, running one at a time and switching between them
/// as their failure policies dictate.
///
/// All state changes go through an action queue. Operations return immediately after enqueueing.
/// Each action is bound to the source that was active when it was enqueued and is dropped if that
/// source has been replaced by the time the action runs.
pub struct CompositeSource {
    inner: Arc<CompositeInner>,
}

impl CompositeSource {
    pub fn new(config: CompositeSourceConfig, sink: Arc<dyn DataSourceUpdates>) -> CompositeSource {
        let inner = Arc::new(CompositeInner {
            queue: ActionQueue::new(),
            state: Mutex::new(CompositeState {
                entries: config.entries,
                next_index: 0,
                current: None,
                started: false,
                disposed: false,
            }),
            generation: AtomicU64::new(0),
            sanitized: Arc::new(StatusSanitizer::new(sink.clone())),
            sink,
            completion: Completion::new(),
            circular: config.circular,
            timed_fallback: config.timed_fallback,
        });
        CompositeSource { inner }
    }

    /// Dispose the current source without starting another one.
    pub fn dispose_current(&self) {
        let owner = self.inner.generation();
        self.inner.enqueue(owner, |inner| inner.dispose_current_now());
    }

    /// Dispose the current source and switch to the next one in the list. Does not start it.
    pub fn go_to_next(&self) {
        let owner = self.inner.generation();
        self.inner.enqueue(owner, |inner| inner.go_to_next_now());
    }

    /// Dispose the current source and switch to the first one in the list. Does not start it.
    pub fn go_to_first(&self) {
        let owner = self.inner.generation();
        self.inner.enqueue(owner, |inner| inner.go_to_first_now());
    }

    /// Permanently remove the entry the current source was created from. The running source is
    /// left alone.
    pub fn blacklist_current(&self) {
        let owner = self.inner.generation();
        self.inner.enqueue(owner, |inner| inner.blacklist_current_now());
    }

    /// Start the current source (if any).
    pub fn start_current(&self) {
        let owner = self.inner.generation();
        self.inner.enqueue(owner, |inner| inner.start_current_now());
    }
}

impl DataSource for CompositeSource {
    /// Start the first source. Subsequent calls only return the same completion.
    ///
    /// The completion resolves to `true` once any source delivers data or reports
    /// [`DataSourceState::Valid`], and to `false` once all sources are exhausted.
    fn start(&self) -> Completion {
        let owner = self.inner.generation();
        self.inner.enqueue(owner, |inner| {
            {
                let mut state = inner.lock_state();
                if state.disposed || state.started {
                    return;
                }
                state.started = true;
            }
            inner.go_to_first_now();
            inner.start_current_now();
        });
        self.inner.completion.clone()
    }

    /// Tear down the current source immediately, bypassing the action queue. Actions still in the
    /// queue become no-ops.
    fn dispose(&self) {
        self.inner.dispose_now();
    }
}

struct CompositeState {
    entries: Vec<SourceEntry>,
    /// Index into `entries` of the entry to instantiate on the next `go_to_next`.
    next_index: usize,
    current: Option<ActiveSource>,
    started: bool,
    disposed: bool,
}

struct ActiveSource {
    entry_id: usize,
    source: Arc<dyn DataSource>,
    proxy: Arc<ForwardingProxy>,
}

impl ActiveSource {
    fn teardown(&self) {
        self.proxy.detach();
        self.proxy.policy.dispose();
        self.source.dispose();
    }
}

pub(super) struct CompositeInner {
    queue: ActionQueue,
    state: Mutex<CompositeState>,
    /// Identity of the current source. Bumped whenever a source is created or torn down.
    generation: AtomicU64,
    /// Downstream sink. Only the exhaustion report goes here directly.
    sink: Arc<dyn DataSourceUpdates>,
    sanitized: Arc<StatusSanitizer>,
    completion: Completion,
    circular: bool,
    timed_fallback: TimedFallbackConfig,
}

impl CompositeInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CompositeState> {
        self.state
            .lock()
            .expect("thread holding composite state lock should not panic")
    }

    fn enqueue(
        self: &Arc<Self>,
        owner: u64,
        action: impl FnOnce(&Arc<CompositeInner>) + Send + 'static,
    ) {
        let inner = Arc::clone(self);
        self.queue.enqueue(
            QueuedAction::new(owner, move || action(&inner)),
            || self.generation(),
        );
    }

    /// Run `transition` on behalf of the source with generation `owner`.
    pub(super) fn transition(self: &Arc<Self>, owner: u64, transition: Transition) {
        log::debug!(target: "eppo", owner = owner; "failure policy requested {transition:?}");
        self.enqueue(owner, move |inner| {
            match transition {
                Transition::Fallback => inner.go_to_next_now(),
                Transition::BlacklistAndFallback => {
                    inner.blacklist_current_now();
                    inner.go_to_next_now();
                }
                Transition::Recover => inner.go_to_first_now(),
            }
            inner.start_current_now();
        });
    }

    fn dispose_current_now(&self) {
        let current = {
            let mut state = self.lock_state();
            let current = state.current.take();
            if current.is_some() {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            current
        };

        if let Some(current) = current {
            log::debug!(target: "eppo", source = current.entry_id; "disposing data source");
            current.teardown();
            // The old source may have reported Off while going away. That is not final for the
            // composite, so make it look like a transition instead.
            self.sanitized.update_status(DataSourceState::Interrupted, None);
        }
    }

    fn go_to_next_now(self: &Arc<Self>) {
        self.dispose_current_now();
        self.activate_next();
    }

    fn go_to_first_now(self: &Arc<Self>) {
        self.dispose_current_now();
        self.lock_state().next_index = 0;
        self.activate_next();
    }

    fn activate_next(self: &Arc<Self>) {
        let next = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            if state.next_index >= state.entries.len() && self.circular {
                state.next_index = 0;
            }
            let index = state.next_index;
            let entry = state.entries.get(index).cloned();
            if entry.is_some() {
                state.next_index += 1;
            }
            entry.map(|entry| (entry, index == 0))
        };

        match next {
            Some((entry, is_primary)) => self.instantiate(entry, is_primary),
            None => self.report_exhausted(),
        }
    }

    fn instantiate(self: &Arc<Self>, entry: SourceEntry, is_primary: bool) {
        let owner = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let policy = FailurePolicy::new(
            entry.policy,
            PolicyContext::new(Arc::downgrade(self), owner),
            &self.timed_fallback,
            is_primary,
        );
        let proxy = Arc::new(ForwardingProxy {
            attached: AtomicBool::new(true),
            sink: self.sanitized.clone(),
            policy,
            completion: self.completion.clone(),
        });

        log::debug!(target: "eppo", source = entry.id; "creating data source");
        let source = entry.factory.create(proxy.clone());
        let active = ActiveSource {
            entry_id: entry.id,
            source,
            proxy,
        };

        let mut state = self.lock_state();
        if state.disposed {
            drop(state);
            active.teardown();
            return;
        }
        state.current = Some(active);
    }

    fn start_current_now(&self) {
        let source = self
            .lock_state()
            .current
            .as_ref()
            .map(|current| current.source.clone());
        if let Some(source) = source {
            // Progress is observed through the forwarding proxy, not through the completion.
            let _ = source.start();
        }
    }

    fn blacklist_current_now(&self) {
        let mut state = self.lock_state();
        let Some(id) = state.current.as_ref().map(|current| current.entry_id) else {
            return;
        };
        if let Some(position) = state.entries.iter().position(|entry| entry.id == id) {
            state.entries.remove(position);
            if position < state.next_index {
                state.next_index -= 1;
            }
            log::debug!(target: "eppo", source = id; "data source blacklisted");
        }
    }

    fn report_exhausted(&self) {
        log::info!(target: "eppo", "{EXHAUSTED_MESSAGE}");
        self.sink.update_status(
            DataSourceState::Off,
            Some(ErrorInfo::new(ErrorKind::Unknown, EXHAUSTED_MESSAGE)),
        );
        self.completion.complete(false);
    }

    fn dispose_now(&self) {
        let current = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            self.generation.fetch_add(1, Ordering::SeqCst);
            state.current.take()
        };

        if let Some(current) = current {
            current.teardown();
            self.sanitized.update_status(DataSourceState::Interrupted, None);
        }
        self.completion.complete(false);
    }
}

/// The sink handed to a source. Forwards to the sanitized downstream sink and then lets the
/// policy observe the outcome. Once detached, everything the source sends is ignored.
struct ForwardingProxy {
    attached: AtomicBool,
    sink: Arc<StatusSanitizer>,
    policy: FailurePolicy,
    completion: Completion,
}

impl ForwardingProxy {
    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn is_attached(&self) -> bool {
        let attached = self.attached.load(Ordering::SeqCst);
        if !attached {
            log::trace!(target: "eppo", "ignoring update from detached data source");
        }
        attached
    }

    fn forward_data(&self, write: impl FnOnce(&StatusSanitizer) -> bool) -> bool {
        if !self.is_attached() {
            return false;
        }
        let stored = write(&self.sink);
        if stored {
            self.completion.complete(true);
        }
        self.policy.on_data(stored);
        stored
    }
}

impl DataSourceUpdates for ForwardingProxy {
    fn init(&self, data: FullDataSet) -> bool {
        self.forward_data(|sink| sink.init(data))
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        self.forward_data(|sink| sink.upsert(kind, key, item))
    }

    fn apply(&self, change_set: ChangeSet) -> bool {
        self.forward_data(|sink| sink.apply(change_set))
    }

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        if !self.is_attached() {
            return;
        }
        self.sink.update_status(state, error.clone());
        if state == DataSourceState::Valid {
            self.completion.complete(true);
        }
        self.policy.on_status(state, error.as_ref());
    }

    fn selector(&self) -> Selector {
        self.sink.selector()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        time::Duration,
    };

    use super::{CompositeSource, CompositeSourceConfig};
    use crate::{
        composite::{PolicyKind, TimedFallbackConfig},
        test_utils::{wait_until, RecordingUpdates},
        ChangeSet, Completion, DataSource, DataSourceFactory, DataSourceState, DataSourceUpdates,
        ErrorInfo, ErrorKind, Selector,
    };

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        /// Report a terminal error on start.
        Off,
        /// Deliver data and report `Valid` on start.
        Succeed,
        /// Report `Interrupted` on start.
        Interrupt,
        /// Report `Off` twice on start.
        OffTwice,
        /// Do nothing.
        Idle,
    }

    struct ScriptedSource {
        behavior: Behavior,
        updates: Arc<dyn DataSourceUpdates>,
        disposed: AtomicBool,
    }

    impl DataSource for ScriptedSource {
        fn start(&self) -> Completion {
            let off = || {
                self.updates.update_status(
                    DataSourceState::Off,
                    Some(ErrorInfo::from_status_code(401)),
                )
            };
            match self.behavior {
                Behavior::Off => off(),
                Behavior::OffTwice => {
                    off();
                    off();
                }
                Behavior::Succeed => {
                    self.updates
                        .apply(ChangeSet::full(Vec::new(), Selector::new(1, "p:1")));
                    self.updates.update_status(DataSourceState::Valid, None);
                }
                Behavior::Interrupt => self.updates.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(ErrorKind::NetworkError, "connection reset")),
                ),
                Behavior::Idle => {}
            }
            Completion::new()
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        behavior: Behavior,
        created: AtomicUsize,
        last: Mutex<Option<Arc<ScriptedSource>>>,
    }

    impl ScriptedFactory {
        fn new(behavior: Behavior) -> Arc<ScriptedFactory> {
            Arc::new(ScriptedFactory {
                behavior,
                created: AtomicUsize::new(0),
                last: Mutex::new(None),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn last(&self) -> Arc<ScriptedSource> {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    impl DataSourceFactory for ScriptedFactory {
        fn create(&self, updates: Arc<dyn DataSourceUpdates>) -> Arc<dyn DataSource> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let source = Arc::new(ScriptedSource {
                behavior: self.behavior,
                updates,
                disposed: AtomicBool::new(false),
            });
            *self.last.lock().unwrap() = Some(source.clone());
            source
        }
    }

    fn config(sources: &[(&Arc<ScriptedFactory>, PolicyKind)]) -> CompositeSourceConfig {
        sources
            .iter()
            .fold(CompositeSourceConfig::new(), |config, (factory, policy)| {
                config.with_shared_source((*factory).clone(), *policy)
            })
    }

    #[test]
    fn exhausting_fail_fast_sources_turns_off() {
        let _ = env_logger::builder().is_test(true).try_init();

        let factories = [
            ScriptedFactory::new(Behavior::Off),
            ScriptedFactory::new(Behavior::Off),
            ScriptedFactory::new(Behavior::Off),
        ];
        let sink = Arc::new(RecordingUpdates::new());
        let composite = CompositeSource::new(
            config(&[
                (&factories[0], PolicyKind::FailFast),
                (&factories[1], PolicyKind::FailFast),
                (&factories[2], PolicyKind::FailFast),
            ]),
            sink.clone(),
        );

        let completion = composite.start();

        assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Some(false));
        for factory in &factories {
            assert_eq!(factory.created(), 1);
            assert!(factory.last().disposed.load(Ordering::SeqCst));
        }
        let (state, error) = sink.statuses().pop().unwrap();
        assert_eq!(state, DataSourceState::Off);
        let error = error.unwrap();
        assert_eq!(error.kind, ErrorKind::Unknown);
        assert!(error.message.contains("exhausted"), "{}", error.message);
        // Only the exhaustion report is Off. Off from individual sources is sanitized.
        assert_eq!(
            sink.states()
                .iter()
                .filter(|state| **state == DataSourceState::Off)
                .count(),
            1
        );
    }

    #[test]
    fn successful_initializer_is_never_created_again() {
        let initializer = ScriptedFactory::new(Behavior::Succeed);
        let synchronizer = ScriptedFactory::new(Behavior::Idle);
        let sink = Arc::new(RecordingUpdates::new());
        let composite = CompositeSource::new(
            config(&[
                (&initializer, PolicyKind::BlacklistOnSuccessOrOff),
                (&synchronizer, PolicyKind::TimedFallback),
            ])
            .with_circular(true),
            sink.clone(),
        );

        let completion = composite.start();

        assert_eq!(completion.value(), Some(true));
        assert_eq!(initializer.created(), 1);
        assert!(initializer.last().disposed.load(Ordering::SeqCst));
        assert_eq!(synchronizer.created(), 1);

        for _ in 0..3 {
            composite.go_to_first();
            composite.start_current();
        }

        assert_eq!(initializer.created(), 1);
        assert_eq!(synchronizer.created(), 4);
        assert_eq!(sink.change_sets().len(), 1);
    }

    #[test]
    fn stale_policy_requests_are_dropped() {
        let flaky = ScriptedFactory::new(Behavior::OffTwice);
        let fallback = ScriptedFactory::new(Behavior::Idle);
        let sink = Arc::new(RecordingUpdates::new());
        let composite = CompositeSource::new(
            config(&[
                (&flaky, PolicyKind::FailFast),
                (&fallback, PolicyKind::FailFast),
            ]),
            sink.clone(),
        );

        composite.start();

        // The second Off was reported by the same source, so its fallback request is stale once
        // the first one has switched sources.
        assert_eq!(fallback.created(), 1);
        assert!(!fallback.last().disposed.load(Ordering::SeqCst));
        assert!(!sink.states().contains(&DataSourceState::Off));
    }

    #[test]
    fn detached_source_is_ignored() {
        let first = ScriptedFactory::new(Behavior::Idle);
        let second = ScriptedFactory::new(Behavior::Idle);
        let sink = Arc::new(RecordingUpdates::new());
        let composite = CompositeSource::new(
            config(&[
                (&first, PolicyKind::FailFast),
                (&second, PolicyKind::FailFast),
            ]),
            sink.clone(),
        );
        composite.start();
        let old = first.last();

        composite.go_to_next();
        let before = sink.calls().len();

        assert!(!old
            .updates
            .apply(ChangeSet::full(Vec::new(), Selector::new(1, "p:1"))));
        old.updates
            .update_status(DataSourceState::Off, Some(ErrorInfo::from_status_code(401)));

        assert_eq!(sink.calls().len(), before);
        assert_eq!(second.created(), 1);
        assert!(!second.last().disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn switching_sources_reports_interrupted() {
        let first = ScriptedFactory::new(Behavior::Succeed);
        let second = ScriptedFactory::new(Behavior::Idle);
        let sink = Arc::new(RecordingUpdates::new());
        let composite = CompositeSource::new(
            config(&[
                (&first, PolicyKind::FailFast),
                (&second, PolicyKind::FailFast),
            ]),
            sink.clone(),
        );
        composite.start();

        composite.go_to_next();

        assert_eq!(
            sink.states(),
            vec![DataSourceState::Valid, DataSourceState::Interrupted]
        );
    }

    #[test]
    fn timed_fallback_is_cancelled_by_recovery() {
        let flaky = ScriptedFactory::new(Behavior::Interrupt);
        let fallback = ScriptedFactory::new(Behavior::Idle);
        let composite = CompositeSource::new(
            config(&[
                (&flaky, PolicyKind::TimedFallback),
                (&fallback, PolicyKind::TimedFallback),
            ])
            .with_circular(true)
            .with_timed_fallback(
                TimedFallbackConfig::new().with_fallback_delay(Duration::from_millis(50)),
            ),
            Arc::new(RecordingUpdates::new()),
        );

        composite.start();
        flaky
            .last()
            .updates
            .update_status(DataSourceState::Valid, None);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fallback.created(), 0);
        assert!(!flaky.last().disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn timed_fallback_fires_while_interrupted() {
        let flaky = ScriptedFactory::new(Behavior::Interrupt);
        let fallback = ScriptedFactory::new(Behavior::Idle);
        let composite = CompositeSource::new(
            config(&[
                (&flaky, PolicyKind::TimedFallback),
                (&fallback, PolicyKind::TimedFallback),
            ])
            .with_circular(true)
            .with_timed_fallback(
                TimedFallbackConfig::new().with_fallback_delay(Duration::from_millis(20)),
            ),
            Arc::new(RecordingUpdates::new()),
        );

        composite.start();

        assert!(wait_until(Duration::from_secs(5), || fallback.created() == 1));
        assert!(flaky.last().disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn timed_fallback_returns_to_primary() {
        let primary = ScriptedFactory::new(Behavior::Interrupt);
        let secondary = ScriptedFactory::new(Behavior::Succeed);
        let composite = CompositeSource::new(
            config(&[
                (&primary, PolicyKind::TimedFallback),
                (&secondary, PolicyKind::TimedFallback),
            ])
            .with_circular(true)
            .with_timed_fallback(
                TimedFallbackConfig::new()
                    .with_fallback_delay(Duration::from_millis(20))
                    .with_recovery_delay(Duration::from_millis(20)),
            ),
            Arc::new(RecordingUpdates::new()),
        );

        composite.start();

        assert!(wait_until(Duration::from_secs(5), || primary.created() >= 2));
        composite.dispose();
    }

    #[test]
    fn off_synchronizer_is_blacklisted() {
        let broken = ScriptedFactory::new(Behavior::Off);
        let healthy = ScriptedFactory::new(Behavior::Idle);
        let composite = CompositeSource::new(
            config(&[
                (&broken, PolicyKind::TimedFallback),
                (&healthy, PolicyKind::TimedFallback),
            ])
            .with_circular(true),
            Arc::new(RecordingUpdates::new()),
        );

        composite.start();
        composite.go_to_next();
        composite.go_to_first();

        assert_eq!(broken.created(), 1);
        assert_eq!(healthy.created(), 3);
    }

    #[test]
    fn dispose_is_idempotent_and_stops_everything() {
        let first = ScriptedFactory::new(Behavior::Idle);
        let second = ScriptedFactory::new(Behavior::Idle);
        let composite = CompositeSource::new(
            config(&[
                (&first, PolicyKind::FailFast),
                (&second, PolicyKind::FailFast),
            ]),
            Arc::new(RecordingUpdates::new()),
        );
        let completion = composite.start();

        composite.dispose();
        composite.dispose();
        composite.go_to_next();
        composite.go_to_first();

        assert!(first.last().disposed.load(Ordering::SeqCst));
        assert_eq!(first.created(), 1);
        assert_eq!(second.created(), 0);
        assert_eq!(completion.value(), Some(false));
    }

    #[test]
    fn background_interruption_of_nested_tier_hands_over() {
        let _ = env_logger::builder().is_test(true).try_init();

        let nested = ScriptedFactory::new(Behavior::Idle);
        let fallback = ScriptedFactory::new(Behavior::Idle);
        let tier = config(&[(&nested, PolicyKind::TimedFallback)]);
        let sink = Arc::new(RecordingUpdates::new());
        let composite = CompositeSource::new(
            CompositeSourceConfig::new()
                .with_source(tier, PolicyKind::FailFast)
                .with_shared_source(fallback.clone(), PolicyKind::FailFast),
            sink.clone(),
        );
        composite.start();

        let updates = nested.last().updates.clone();
        let (done_sender, done) = mpsc::channel();
        std::thread::spawn(move || {
            updates.update_status(
                DataSourceState::Interrupted,
                Some(ErrorInfo::new(ErrorKind::NetworkError, "connection reset")),
            );
            let _ = done_sender.send(());
        });

        // The reporting thread drains the outer queue, which tears down the nested tier.
        assert!(done.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(fallback.created(), 1);
        assert!(nested.last().disposed.load(Ordering::SeqCst));
        assert!(!fallback.last().disposed.load(Ordering::SeqCst));
        assert_eq!(sink.states().first(), Some(&DataSourceState::Interrupted));
        assert!(!sink.states().contains(&DataSourceState::Off));
    }

    #[test]
    fn exhausted_nested_tier_hands_over() {
        let initializers = [
            ScriptedFactory::new(Behavior::Off),
            ScriptedFactory::new(Behavior::Off),
        ];
        let synchronizer = ScriptedFactory::new(Behavior::Succeed);
        let tier = config(&[
            (&initializers[0], PolicyKind::FailFast),
            (&initializers[1], PolicyKind::FailFast),
        ]);
        let sink = Arc::new(RecordingUpdates::new());
        let composite = CompositeSource::new(
            CompositeSourceConfig::new()
                .with_source(tier, PolicyKind::BlacklistOnSuccessOrOff)
                .with_shared_source(synchronizer.clone(), PolicyKind::TimedFallback)
                .with_circular(true),
            sink.clone(),
        );

        let completion = composite.start();

        assert_eq!(completion.value(), Some(true));
        assert_eq!(synchronizer.created(), 1);
        assert!(!sink.states().contains(&DataSourceState::Off));
        assert_eq!(sink.states().last(), Some(&DataSourceState::Valid));

        // The tier is gone for good.
        composite.go_to_next();
        composite.start_current();
        assert_eq!(initializers[0].created(), 1);
        assert_eq!(synchronizer.created(), 2);
    }
}
