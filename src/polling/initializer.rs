use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    Completion, DataSource, DataSourceFactory, DataSourceState, DataSourceUpdates, Error,
    ErrorInfo, Result,
};

use super::{requester::PollingRequester, PollingConfig};

/// Requests flag data once.
///
/// On success, the data is applied and [`DataSourceState::Valid`] is reported. On failure, the
/// initializer reports [`DataSourceState::Off`], as it never retries.
pub struct PollingInitializer {
    config: PollingConfig,
    updates: Arc<dyn DataSourceUpdates>,
    started: AtomicBool,
    disposed: Arc<AtomicBool>,
    completion: Completion,
}

impl PollingInitializer {
    pub fn new(config: PollingConfig, updates: Arc<dyn DataSourceUpdates>) -> PollingInitializer {
        PollingInitializer {
            config,
            updates,
            started: AtomicBool::new(false),
            disposed: Arc::new(AtomicBool::new(false)),
            completion: Completion::new(),
        }
    }

    /// Factory creating a polling initializer for every sink it is given.
    pub fn factory(config: PollingConfig) -> impl DataSourceFactory {
        move |updates: Arc<dyn DataSourceUpdates>| -> Arc<dyn DataSource> {
            Arc::new(PollingInitializer::new(config.clone(), updates))
        }
    }
}

impl DataSource for PollingInitializer {
    fn start(&self) -> Completion {
        if self.started.swap(true, Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst) {
            return self.completion.clone();
        }

        let config = self.config.clone();
        let updates = self.updates.clone();
        let disposed = self.disposed.clone();
        let completion = self.completion.clone();

        let spawned = std::thread::Builder::new()
            .name("eppo-polling-initializer".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    request_once(&config, updates.as_ref())
                }))
                .unwrap_or(Err(Error::ThreadPanicked));

                if disposed.load(Ordering::SeqCst) {
                    completion.complete(false);
                    return;
                }
                match result {
                    Ok(stored) => {
                        if stored {
                            updates.update_status(DataSourceState::Valid, None);
                        }
                        completion.complete(stored);
                    }
                    Err(err) => {
                        log::warn!(target: "eppo", "polling initializer failed: {err}");
                        updates.update_status(DataSourceState::Off, Some(ErrorInfo::from(&err)));
                        completion.complete(false);
                    }
                }
            });

        if let Err(err) = spawned {
            let err = Error::from(err);
            log::warn!(target: "eppo", "failed to start polling initializer: {err}");
            self.updates
                .update_status(DataSourceState::Off, Some(ErrorInfo::from(&err)));
            self.completion.complete(false);
        }

        self.completion.clone()
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Make a single request and apply the result. Returns whether the data has been stored.
fn request_once(config: &PollingConfig, updates: &dyn DataSourceUpdates) -> Result<bool> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let requester = PollingRequester::new(config)?;

    let response = runtime.block_on(requester.request(&updates.selector()))?;
    let change_set = response.into_change_set()?;
    Ok(updates.apply(change_set))
}
