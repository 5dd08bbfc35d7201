//! Data sources that request flag data over HTTP.
//!
//! [`PollingInitializer`] makes a single request and is meant to be used as an initializer.
//! [`PollingSynchronizer`] keeps polling on a background thread. Both send the selector of the
//! data they already have as `basis`, so the server can respond with changes only.
use std::time::Duration;

use rand::{thread_rng, Rng};

mod initializer;
mod requester;
mod synchronizer;

pub use initializer::PollingInitializer;
pub use synchronizer::PollingSynchronizer;

/// Configuration for polling data sources.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Base URL of the service. Requests go to `{base_url}/sdk/poll`.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_BASE_URL`].
    pub base_url: String,
    /// Key sent in the `Authorization` header.
    pub sdk_key: String,
    /// Interval to wait between requests.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests. This helps to avoid
    /// multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
    /// Maximum time a single request may take.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_REQUEST_TIMEOUT`].
    pub request_timeout: Duration,
}

impl PollingConfig {
    /// Default value for [`PollingConfig::base_url`].
    pub const DEFAULT_BASE_URL: &'static str = "https://sdk.eppo.cloud";
    /// Default value for [`PollingConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollingConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`PollingConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a new `PollingConfig` using default configuration.
    pub fn new(sdk_key: impl Into<String>) -> PollingConfig {
        PollingConfig {
            base_url: PollingConfig::DEFAULT_BASE_URL.to_owned(),
            sdk_key: sdk_key.into(),
            interval: PollingConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollingConfig::DEFAULT_POLL_JITTER,
            request_timeout: PollingConfig::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> PollingConfig {
        self.base_url = base_url.into();
        self
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollingConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollingConfig {
        self.jitter = jitter;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> PollingConfig {
        self.request_timeout = timeout;
        self
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
