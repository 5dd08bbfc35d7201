//! Status stabilization for sinks fed by several internally-churning data sources.
use std::sync::{Arc, Mutex};

use crate::{
    status::same_error, ChangeSet, DataKind, DataSourceState, DataSourceUpdates, ErrorInfo,
    FullDataSet, ItemDescriptor, Selector,
};

#[derive(Debug, Default)]
struct SanitizerState {
    reported_initializing: bool,
    last: Option<(DataSourceState, Option<ErrorInfo>)>,
}

/// Wraps a sink and cleans up the status stream going into it:
///
/// - `Initializing` is reported at most once per lifetime of the sanitizer.
/// - `Off` is reported as `Interrupted`. Only the top-level supervisor may turn the SDK off, and
///   it does so without going through a sanitizer.
/// - A status identical to the previous one (same state and same error) is dropped.
///
/// Data calls are passed through unchanged.
pub struct StatusSanitizer {
    sink: Arc<dyn DataSourceUpdates>,
    state: Mutex<SanitizerState>,
}

impl StatusSanitizer {
    pub fn new(sink: Arc<dyn DataSourceUpdates>) -> StatusSanitizer {
        StatusSanitizer {
            sink,
            state: Mutex::new(SanitizerState::default()),
        }
    }
}

impl DataSourceUpdates for StatusSanitizer {
    fn init(&self, data: FullDataSet) -> bool {
        self.sink.init(data)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        self.sink.upsert(kind, key, item)
    }

    fn apply(&self, change_set: ChangeSet) -> bool {
        self.sink.apply(change_set)
    }

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let state = match state {
            DataSourceState::Off => DataSourceState::Interrupted,
            state => state,
        };

        {
            let mut sanitizer = self
                .state
                .lock()
                .expect("thread holding sanitizer lock should not panic");

            if state == DataSourceState::Initializing {
                if sanitizer.reported_initializing {
                    return;
                }
                sanitizer.reported_initializing = true;
            }

            if let Some((last_state, last_error)) = &sanitizer.last {
                if *last_state == state && same_error(last_error.as_ref(), error.as_ref()) {
                    return;
                }
            }

            sanitizer.last = Some((state, error.clone()));
        }

        // Forwarding may re-enter this sanitizer (e.g., a supervisor tearing down the nested
        // composite that owns it), so the lock must not be held here.
        self.sink.update_status(state, error);
    }

    fn selector(&self) -> Selector {
        self.sink.selector()
    }
}
