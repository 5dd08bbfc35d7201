use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{Receiver, RecvTimeoutError, SyncSender},
    Arc, Mutex,
};

use crate::{
    status::is_http_error_recoverable, Completion, DataSource, DataSourceFactory,
    DataSourceState, DataSourceUpdates, Error, ErrorInfo,
};

use super::{jitter, requester::PollingRequester, PollingConfig};

/// Polls for flag data on a background thread.
///
/// Recoverable errors are reported as [`DataSourceState::Interrupted`] and polling continues.
/// Unrecoverable errors (e.g., an invalid SDK key) are reported as [`DataSourceState::Off`] and
/// stop the poller.
pub struct PollingSynchronizer {
    config: PollingConfig,
    updates: Arc<dyn DataSourceUpdates>,
    /// Used to send a stop command to the poller thread. `None` until started and after disposal.
    stop_sender: Mutex<Option<SyncSender<()>>>,
    started: AtomicBool,
    completion: Completion,
}

impl PollingSynchronizer {
    pub fn new(config: PollingConfig, updates: Arc<dyn DataSourceUpdates>) -> PollingSynchronizer {
        PollingSynchronizer {
            config,
            updates,
            stop_sender: Mutex::new(None),
            started: AtomicBool::new(false),
            completion: Completion::new(),
        }
    }

    /// Factory creating a polling synchronizer for every sink it is given.
    pub fn factory(config: PollingConfig) -> impl DataSourceFactory {
        move |updates: Arc<dyn DataSourceUpdates>| -> Arc<dyn DataSource> {
            Arc::new(PollingSynchronizer::new(config.clone(), updates))
        }
    }
}

impl DataSource for PollingSynchronizer {
    fn start(&self) -> Completion {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.completion.clone();
        }

        // Using `sync_channel` here as it makes `stop_sender` `Sync`. Buffer size of 1 is enough
        // as we only ever send a single stop command.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        *self
            .stop_sender
            .lock()
            .expect("thread holding stop sender lock should not panic") = Some(stop_sender);

        let poller = Poller {
            config: self.config.clone(),
            updates: self.updates.clone(),
            completion: self.completion.clone(),
            stop_receiver,
        };
        let spawned = std::thread::Builder::new()
            .name("eppo-poller".to_owned())
            .spawn(move || {
                let updates = poller.updates.clone();
                let completion = poller.completion.clone();
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| poller.run()));
                if result.is_err() {
                    let err = Error::ThreadPanicked;
                    log::error!(target: "eppo", "poller thread panicked");
                    updates.update_status(DataSourceState::Off, Some(ErrorInfo::from(&err)));
                    completion.complete(false);
                }
            });

        if let Err(err) = spawned {
            let err = Error::from(err);
            log::warn!(target: "eppo", "failed to start poller thread: {err}");
            self.updates
                .update_status(DataSourceState::Off, Some(ErrorInfo::from(&err)));
            self.completion.complete(false);
        }

        self.completion.clone()
    }

    /// Stop the poller thread. Does not wait for the thread to actually stop.
    fn dispose(&self) {
        // A disposed synchronizer must not be started later.
        self.started.store(true, Ordering::SeqCst);
        let stop_sender = self
            .stop_sender
            .lock()
            .expect("thread holding stop sender lock should not panic")
            .take();
        if let Some(stop_sender) = stop_sender {
            // Error means that the receiver was dropped (thread exited) or the buffer is full
            // (stop command already sent). The thread is stopping either way.
            let _ = stop_sender.try_send(());
        }
    }
}

/// State owned by the poller thread.
struct Poller {
    config: PollingConfig,
    updates: Arc<dyn DataSourceUpdates>,
    completion: Completion,
    stop_receiver: Receiver<()>,
}

impl Poller {
    fn run(self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => return self.turn_off(Error::from(err)),
        };
        let requester = match PollingRequester::new(&self.config) {
            Ok(requester) => requester,
            Err(err) => return self.turn_off(err),
        };

        loop {
            let result = runtime
                .block_on(requester.request(&self.updates.selector()))
                .and_then(|response| response.into_change_set());

            if self.stop_requested() {
                return;
            }

            match result {
                Ok(change_set) => {
                    if self.updates.apply(change_set) {
                        self.updates.update_status(DataSourceState::Valid, None);
                        self.completion.complete(true);
                    }
                }
                Err(Error::ErrorResponse { status }) if !is_http_error_recoverable(status) => {
                    return self.turn_off(Error::ErrorResponse { status });
                }
                Err(err) => {
                    log::warn!(target: "eppo", "polling failed, will retry: {err}");
                    self.updates
                        .update_status(DataSourceState::Interrupted, Some(ErrorInfo::from(&err)));
                }
            }

            let timeout = jitter(self.config.interval, self.config.jitter);
            match self.stop_receiver.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    // Timed out. Loop back to poll again.
                }
                Ok(()) => {
                    log::debug!(target: "eppo", "poller thread received stop command");
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!(target: "eppo", "poller thread received disconnected");
                    return;
                }
            }
        }
    }

    fn stop_requested(&self) -> bool {
        !matches!(
            self.stop_receiver.try_recv(),
            Err(std::sync::mpsc::TryRecvError::Empty)
        )
    }

    fn turn_off(&self, err: Error) {
        log::warn!(target: "eppo", "polling stopped: {err}");
        self.updates
            .update_status(DataSourceState::Off, Some(ErrorInfo::from(&err)));
        self.completion.complete(false);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, Request, ResponseTemplate,
    };

    use super::PollingSynchronizer;
    use crate::{
        polling::PollingConfig,
        test_utils::{wait_until, RecordingUpdates},
        DataSource, DataSourceState,
    };

    fn transfer(state: &str, version: i64) -> String {
        format!(
            r#"{{"events": [
                {{"event": "server-intent", "data": {{"payloads": [{{"id": "p", "target": {version}, "intentCode": "xfer-changes", "reason": "test"}}]}}}},
                {{"event": "put-object", "data": {{"kind": "flag", "key": "a", "version": {version}, "object": {{}}}}}},
                {{"event": "payload-transferred", "data": {{"state": "{state}", "version": {version}}}}}
            ]}}"#
        )
    }

    fn config(base_url: String) -> PollingConfig {
        PollingConfig::new("sdk-key")
            .with_base_url(base_url)
            .with_interval(Duration::from_millis(10))
            .with_jitter(Duration::ZERO)
    }

    fn basis(request: &Request) -> Option<String> {
        request
            .url
            .query_pairs()
            .find(|(name, _)| name == "basis")
            .map(|(_, value)| value.into_owned())
    }

    #[tokio::test]
    async fn recovers_from_server_errors_and_sends_basis() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mock_server = MockServer::start().await;
        // Mocks are matched in mount order, so each limited one answers before the next.
        Mock::given(method("GET"))
            .and(path("/sdk/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_string(transfer("p:1", 1)))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sdk/poll"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sdk/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_string(transfer("p:2", 2)))
            .mount(&mock_server)
            .await;

        let sink = Arc::new(RecordingUpdates::new());
        let synchronizer = PollingSynchronizer::new(config(mock_server.uri()), sink.clone());

        synchronizer.start();
        assert!(wait_until(Duration::from_secs(10), || sink.change_sets().len() >= 2));
        synchronizer.dispose();

        let states = sink.states();
        assert_eq!(
            &states[..3],
            &[
                DataSourceState::Valid,
                DataSourceState::Interrupted,
                DataSourceState::Valid
            ]
        );
        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(basis(&requests[0]), None);
        assert_eq!(basis(&requests[1]).as_deref(), Some("p:1"));
        assert_eq!(basis(&requests[2]).as_deref(), Some("p:1"));
    }

    #[tokio::test]
    async fn unauthorized_turns_off_and_stops() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/poll"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let sink = Arc::new(RecordingUpdates::new());
        let synchronizer = PollingSynchronizer::new(config(mock_server.uri()), sink.clone());

        let completion = synchronizer.start();

        assert_eq!(completion.wait_timeout(Duration::from_secs(10)), Some(false));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.states(), vec![DataSourceState::Off]);
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    }

    #[test]
    fn dispose_is_idempotent() {
        let sink = Arc::new(RecordingUpdates::new());
        let synchronizer = PollingSynchronizer::new(
            config("http://127.0.0.1:9".to_owned()).with_interval(Duration::from_secs(60)),
            sink,
        );

        synchronizer.dispose();
        synchronizer.start();
        synchronizer.dispose();
        synchronizer.dispose();
    }
}
