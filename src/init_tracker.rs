//! Decides when the SDK as a whole has enough data to be considered initialized.
use std::sync::{Arc, Mutex};

use crate::{
    ChangeSet, Completion, DataKind, DataSourceState, DataSourceUpdates, ErrorInfo, FullDataSet,
    ItemDescriptor, Selector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// No data has been received yet and initializers may still deliver some.
    NoData,
    /// Some data has been received, but it may not be current (no selector).
    Data,
    /// All initializers are done without delivering any data.
    InitializersExhausted,
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitEvent {
    ChangeSet { has_selector: bool },
    InitializersExhausted,
}

impl InitState {
    fn next(self, event: InitEvent) -> InitState {
        match (self, event) {
            (InitState::Initialized, _) => InitState::Initialized,
            // Data with a selector is known to be current.
            (_, InitEvent::ChangeSet { has_selector: true }) => InitState::Initialized,
            (InitState::NoData, InitEvent::ChangeSet { .. }) => InitState::Data,
            (InitState::InitializersExhausted, InitEvent::ChangeSet { .. }) => {
                InitState::Initialized
            }
            (InitState::Data, InitEvent::ChangeSet { .. }) => InitState::Data,
            (InitState::NoData, InitEvent::InitializersExhausted) => {
                InitState::InitializersExhausted
            }
            (InitState::Data, InitEvent::InitializersExhausted) => InitState::Initialized,
            (InitState::InitializersExhausted, InitEvent::InitializersExhausted) => {
                InitState::InitializersExhausted
            }
        }
    }
}

/// A sink decorator that watches stored data and the initializer tier to decide when the SDK is
/// initialized.
///
/// The completion resolves to `true` once [`InitState::Initialized`] is reached, and to `false`
/// if the data sources turn off before that.
pub struct InitTracker {
    sink: Arc<dyn DataSourceUpdates>,
    state: Mutex<InitState>,
    completion: Completion,
}

impl InitTracker {
    pub fn new(sink: Arc<dyn DataSourceUpdates>) -> InitTracker {
        InitTracker {
            sink,
            state: Mutex::new(InitState::NoData),
            completion: Completion::new(),
        }
    }

    /// Create a tracker for a configuration without data sources. There is nothing to wait for.
    pub fn initialized(sink: Arc<dyn DataSourceUpdates>) -> InitTracker {
        InitTracker {
            sink,
            state: Mutex::new(InitState::Initialized),
            completion: Completion::resolved(true),
        }
    }

    pub fn state(&self) -> InitState {
        *self
            .state
            .lock()
            .expect("thread holding init state lock should not panic")
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Signal that the initializer tier is done.
    pub fn initializers_exhausted(&self) {
        self.handle(InitEvent::InitializersExhausted);
    }

    fn handle(&self, event: InitEvent) {
        let new_state = {
            let mut state = self
                .state
                .lock()
                .expect("thread holding init state lock should not panic");
            let previous = *state;
            *state = previous.next(event);
            if *state == previous {
                return;
            }
            *state
        };

        log::debug!(target: "eppo", "initialization state changed to {new_state:?}");
        if new_state == InitState::Initialized {
            log::info!(target: "eppo", "data system initialized");
            self.completion.complete(true);
        }
    }
}

impl DataSourceUpdates for InitTracker {
    fn init(&self, data: FullDataSet) -> bool {
        let stored = self.sink.init(data);
        if stored {
            self.handle(InitEvent::ChangeSet {
                has_selector: false,
            });
        }
        stored
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        let stored = self.sink.upsert(kind, key, item);
        if stored {
            self.handle(InitEvent::ChangeSet {
                has_selector: false,
            });
        }
        stored
    }

    fn apply(&self, change_set: ChangeSet) -> bool {
        let has_selector = !change_set.selector().is_empty();
        let stored = self.sink.apply(change_set);
        if stored {
            self.handle(InitEvent::ChangeSet { has_selector });
        }
        stored
    }

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        self.sink.update_status(state, error);
        if state == DataSourceState::Off {
            self.completion.complete(false);
        }
    }

    fn selector(&self) -> Selector {
        self.sink.selector()
    }
}
