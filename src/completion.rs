//! A one-shot, thread-safe signal used to report the outcome of starting a data source.
use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// The outcome of [`DataSource::start`](crate::DataSource::start).
///
/// Holds `None` until the data source has either received data (`Some(true)`) or given up
/// (`Some(false)`). The first resolution wins; later calls to [`Completion::complete`] are
/// ignored. Clones share the same underlying signal.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<Option<bool>>, Condvar)>,
}

impl Completion {
    pub fn new() -> Completion {
        Completion::default()
    }

    /// Create a completion that is already resolved with `value`.
    pub fn resolved(value: bool) -> Completion {
        let completion = Completion::new();
        completion.complete(value);
        completion
    }

    /// Resolve the completion. Returns `true` if this call resolved it.
    pub fn complete(&self, value: bool) -> bool {
        let mut slot = self
            .inner
            .0
            .lock()
            .expect("thread holding completion lock should not panic");
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.inner.1.notify_all();
        true
    }

    /// Returns the resolved value, or `None` if not resolved yet.
    pub fn value(&self) -> Option<bool> {
        *self
            .inner
            .0
            .lock()
            .expect("thread holding completion lock should not panic")
    }

    pub fn is_complete(&self) -> bool {
        self.value().is_some()
    }

    /// Block until the completion is resolved.
    pub fn wait(&self) -> bool {
        let mut lock = self
            .inner
            .0
            .lock()
            .expect("thread holding completion lock should not panic");
        loop {
            match *lock {
                Some(value) => return value,
                None => {
                    lock = self
                        .inner
                        .1
                        .wait(lock)
                        .expect("thread holding completion lock should not panic");
                }
            }
        }
    }

    /// Block until the completion is resolved or `timeout` elapses. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut lock = self
            .inner
            .0
            .lock()
            .expect("thread holding completion lock should not panic");
        loop {
            if let Some(value) = *lock {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            lock = self
                .inner
                .1
                .wait_timeout(lock, deadline - now)
                .expect("thread holding completion lock should not panic")
                .0;
        }
    }
}
