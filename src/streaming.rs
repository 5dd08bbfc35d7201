//! A synchronizer receiving flag data over a long-lived event stream (e.g., server-sent events).
//!
//! The SDK does not ship an SSE client. The embedding application supplies an
//! [`EventSourceConnector`] that opens a connection and yields [`RawEvent`]s. Everything above
//! that (protocol handling, reconnecting, status reporting) is done here.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    protocol::{InternalErrorKind, ProtocolAction, ProtocolHandler},
    status::is_http_error_recoverable,
    Completion, DataSource, DataSourceFactory, DataSourceState, DataSourceUpdates, Error,
    ErrorInfo, ErrorKind, Result, Selector,
};

/// An event as received from the wire: event name and undecoded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub name: String,
    pub data: String,
}

impl RawEvent {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> RawEvent {
        RawEvent {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Opens event stream connections.
pub trait EventSourceConnector: Send + Sync {
    /// Open a new connection. `basis` is the selector of the data already received (empty if
    /// none) and should be sent to the server so it can resume from there.
    ///
    /// # Errors
    ///
    /// Return [`Error::ErrorResponse`] if the server rejected the connection, so that the
    /// synchronizer can tell recoverable and unrecoverable failures apart.
    fn connect(&self, basis: &Selector) -> Result<Box<dyn EventStream>>;
}

/// An open event stream connection.
pub trait EventStream: Send {
    /// Block until the next event arrives. Returns `None` once the connection is closed.
    ///
    /// Implementations should not block forever without traffic (servers send heartbeats), as
    /// disposal of the synchronizer is only observed between events.
    fn next_event(&mut self) -> Option<Result<RawEvent>>;
}

/// Configuration for [`StreamingSynchronizer`].
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Delay before the first reconnection attempt. Doubles with every failed attempt.
    ///
    /// Defaults to [`StreamingConfig::DEFAULT_INITIAL_RECONNECT_DELAY`].
    pub initial_reconnect_delay: Duration,
    /// Upper bound for the reconnection delay.
    ///
    /// Defaults to [`StreamingConfig::DEFAULT_MAX_RECONNECT_DELAY`].
    pub max_reconnect_delay: Duration,
}

impl StreamingConfig {
    /// Default value for [`StreamingConfig::initial_reconnect_delay`].
    pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`StreamingConfig::max_reconnect_delay`].
    pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

    pub fn new() -> StreamingConfig {
        StreamingConfig::default()
    }

    pub fn with_initial_reconnect_delay(mut self, delay: Duration) -> StreamingConfig {
        self.initial_reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> StreamingConfig {
        self.max_reconnect_delay = delay;
        self
    }

    /// Delay before reconnection attempt number `attempt` (starting at 0): exponential backoff
    /// capped at `max_reconnect_delay`, with the lower half randomized.
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_reconnect_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_reconnect_delay);
        let half = delay / 2;
        half + thread_rng().gen_range(Duration::ZERO..=half)
    }
}

impl Default for StreamingConfig {
    fn default() -> StreamingConfig {
        StreamingConfig {
            initial_reconnect_delay: StreamingConfig::DEFAULT_INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: StreamingConfig::DEFAULT_MAX_RECONNECT_DELAY,
        }
    }
}

/// Receives flag data from an event stream and reconnects when the stream fails.
pub struct StreamingSynchronizer {
    config: StreamingConfig,
    connector: Arc<dyn EventSourceConnector>,
    updates: Arc<dyn DataSourceUpdates>,
    stop_sender: Mutex<Option<SyncSender<()>>>,
    stopped: Arc<AtomicBool>,
    started: AtomicBool,
    completion: Completion,
}

impl StreamingSynchronizer {
    pub fn new(
        config: StreamingConfig,
        connector: Arc<dyn EventSourceConnector>,
        updates: Arc<dyn DataSourceUpdates>,
    ) -> StreamingSynchronizer {
        StreamingSynchronizer {
            config,
            connector,
            updates,
            stop_sender: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            completion: Completion::new(),
        }
    }

    /// Factory creating a streaming synchronizer for every sink it is given.
    pub fn factory(
        config: StreamingConfig,
        connector: Arc<dyn EventSourceConnector>,
    ) -> impl DataSourceFactory {
        move |updates: Arc<dyn DataSourceUpdates>| -> Arc<dyn DataSource> {
            Arc::new(StreamingSynchronizer::new(
                config.clone(),
                connector.clone(),
                updates,
            ))
        }
    }
}

impl DataSource for StreamingSynchronizer {
    fn start(&self) -> Completion {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.completion.clone();
        }

        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        *self
            .stop_sender
            .lock()
            .expect("thread holding stop sender lock should not panic") = Some(stop_sender);

        let stream = StreamThread {
            config: self.config.clone(),
            connector: self.connector.clone(),
            updates: self.updates.clone(),
            completion: self.completion.clone(),
            stopped: self.stopped.clone(),
            stop_receiver,
            handler: ProtocolHandler::new(),
            attempt: 0,
        };
        let spawned = std::thread::Builder::new()
            .name("eppo-stream".to_owned())
            .spawn(move || {
                let updates = stream.updates.clone();
                let completion = stream.completion.clone();
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| stream.run()));
                if result.is_err() {
                    log::error!(target: "eppo", "stream thread panicked");
                    updates.update_status(
                        DataSourceState::Off,
                        Some(ErrorInfo::from(&Error::ThreadPanicked)),
                    );
                    completion.complete(false);
                }
            });

        if let Err(err) = spawned {
            let err = Error::from(err);
            log::warn!(target: "eppo", "failed to start stream thread: {err}");
            self.updates
                .update_status(DataSourceState::Off, Some(ErrorInfo::from(&err)));
            self.completion.complete(false);
        }

        self.completion.clone()
    }

    /// Stop the stream thread. Does not wait for the thread to actually stop.
    fn dispose(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        let stop_sender = self
            .stop_sender
            .lock()
            .expect("thread holding stop sender lock should not panic")
            .take();
        if let Some(stop_sender) = stop_sender {
            let _ = stop_sender.try_send(());
        }
    }
}

/// How a connection ended.
enum Disconnect {
    /// Disposed. Do not reconnect.
    Stopped,
    /// Reconnect after a delay. The status has already been reported.
    Retry,
    /// Give up. The status has already been reported.
    Terminal,
}

/// State owned by the stream thread.
struct StreamThread {
    config: StreamingConfig,
    connector: Arc<dyn EventSourceConnector>,
    updates: Arc<dyn DataSourceUpdates>,
    completion: Completion,
    stopped: Arc<AtomicBool>,
    stop_receiver: Receiver<()>,
    handler: ProtocolHandler,
    /// Number of reconnection attempts since data was last received.
    attempt: u32,
}

impl StreamThread {
    fn run(mut self) {
        loop {
            if self.is_stopped() {
                return;
            }

            let basis = self.updates.selector();
            log::debug!(target: "eppo", "connecting to event stream");
            let disconnect = match self.connector.connect(&basis) {
                Ok(mut stream) => {
                    self.handler.reset();
                    self.consume(stream.as_mut())
                }
                Err(err) => self.connection_failed(err),
            };

            match disconnect {
                Disconnect::Stopped | Disconnect::Terminal => return,
                Disconnect::Retry => {}
            }

            let delay = self.config.reconnect_delay(self.attempt);
            self.attempt = self.attempt.saturating_add(1);
            log::debug!(target: "eppo", "reconnecting to event stream in {delay:?}");
            match self.stop_receiver.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    log::debug!(target: "eppo", "stream thread received stop command");
                    return;
                }
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn consume(&mut self, stream: &mut dyn EventStream) -> Disconnect {
        while let Some(event) = stream.next_event() {
            if self.is_stopped() {
                return Disconnect::Stopped;
            }

            let event = match event {
                Ok(event) => event,
                Err(err) => return self.connection_failed(err),
            };

            match self.handler.handle_raw(&event.name, &event.data) {
                ProtocolAction::ChangeSet(change_set) => {
                    if !self.updates.apply(change_set) {
                        // The store failure has been reported already. Reconnecting makes the
                        // server send the data again.
                        return Disconnect::Retry;
                    }
                    self.attempt = 0;
                    self.updates.update_status(DataSourceState::Valid, None);
                    self.completion.complete(true);
                }
                ProtocolAction::Error { id, reason } => {
                    log::warn!(
                        target: "eppo",
                        payload = id.as_str();
                        "server reported an error, waiting for the payload to be resent: {reason}"
                    );
                }
                ProtocolAction::Goodbye { reason } => {
                    log::info!(target: "eppo", "server is closing the stream: {reason}");
                }
                ProtocolAction::InternalError {
                    kind: InternalErrorKind::UnknownEvent,
                    message,
                } => {
                    log::debug!(target: "eppo", "{message}");
                }
                ProtocolAction::InternalError { kind, message } => {
                    log::error!(
                        target: "eppo",
                        "failed to process event stream ({kind:?}): {message}"
                    );
                    self.updates.update_status(
                        DataSourceState::Interrupted,
                        Some(ErrorInfo::new(ErrorKind::InvalidData, message)),
                    );
                    return Disconnect::Retry;
                }
                ProtocolAction::NoAction => {}
            }
        }

        if self.is_stopped() {
            return Disconnect::Stopped;
        }
        log::debug!(target: "eppo", "event stream closed");
        self.updates.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::new(
                ErrorKind::NetworkError,
                "event stream closed by server",
            )),
        );
        Disconnect::Retry
    }

    fn connection_failed(&self, err: Error) -> Disconnect {
        if self.is_stopped() {
            return Disconnect::Stopped;
        }

        let recoverable = match &err {
            Error::ErrorResponse { status } => is_http_error_recoverable(*status),
            Error::InvalidBaseUrl(_) => false,
            _ => true,
        };
        if recoverable {
            log::warn!(target: "eppo", "event stream failed, will reconnect: {err}");
            self.updates
                .update_status(DataSourceState::Interrupted, Some(ErrorInfo::from(&err)));
            Disconnect::Retry
        } else {
            log::warn!(target: "eppo", "event stream failed permanently: {err}");
            self.updates
                .update_status(DataSourceState::Off, Some(ErrorInfo::from(&err)));
            self.completion.complete(false);
            Disconnect::Terminal
        }
    }
}
