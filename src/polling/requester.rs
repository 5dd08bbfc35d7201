//! An HTTP client that requests flag data from the polling endpoint.
use reqwest::{header::AUTHORIZATION, StatusCode, Url};
use serde::Deserialize;

use crate::{
    protocol::{ChangeSetBuilder, IntentCode, ProtocolEvent},
    ChangeSet, DataKind, Error, Result, Selector,
};

use super::PollingConfig;

const POLL_ENDPOINT: &str = "sdk/poll";

/// Body of a polling response: the same events a streaming connection would deliver, in a batch.
#[derive(Debug, Deserialize)]
pub(crate) struct PollResponse {
    #[serde(default)]
    events: Vec<PollEvent>,
}

#[derive(Debug, Deserialize)]
struct PollEvent {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

pub(crate) struct PollingRequester {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    url: Url,
    sdk_key: String,
}

impl PollingRequester {
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if the endpoint URL cannot be built from the base URL.
    /// - [`Error::Network`] if the HTTP client cannot be created.
    pub(crate) fn new(config: &PollingConfig) -> Result<PollingRequester> {
        let url = Url::parse(&format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            POLL_ENDPOINT
        ))
        .map_err(Error::InvalidBaseUrl)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(PollingRequester {
            client,
            url,
            sdk_key: config.sdk_key.clone(),
        })
    }

    fn poll_url(&self, basis: &Selector) -> Url {
        let mut url = self.url.clone();
        if !basis.is_empty() {
            url.query_pairs_mut().append_pair("basis", basis.state());
        }
        url
    }

    pub(crate) async fn request(&self, basis: &Selector) -> Result<PollResponse> {
        log::debug!(target: "eppo", "polling for flag data");
        let response = self
            .client
            .get(self.poll_url(basis))
            .header(AUTHORIZATION, &self.sdk_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                log::warn!(target: "eppo", "client is not authorized. Check your SDK key");
            } else {
                log::warn!(target: "eppo", "received non-200 response while polling: {status}");
            }
            return Err(Error::ErrorResponse {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let response = serde_json::from_slice(&body)?;
        log::debug!(target: "eppo", "successfully polled flag data");
        Ok(response)
    }
}

impl PollResponse {
    /// Assemble the events of the response into a change set.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidData`] if event data cannot be decoded.
    /// - [`Error::Protocol`] if events are out of order, the server reported an error, or the
    ///   response ends before the payload has been transferred.
    pub(crate) fn into_change_set(self) -> Result<ChangeSet> {
        let mut builder = ChangeSetBuilder::new();
        let mut started = false;

        for event in self.events {
            match ProtocolEvent::from_wire(&event.event, &event.data)? {
                ProtocolEvent::ServerIntent(intent) => {
                    let payload = intent.payloads.into_iter().next().ok_or_else(|| {
                        Error::Protocol("server intent does not contain any payload".to_owned())
                    })?;
                    match payload.intent_code {
                        IntentCode::None => return Ok(ChangeSet::none(Selector::empty())),
                        IntentCode::Unknown => {
                            return Err(Error::Protocol("unhandled intent code".to_owned()))
                        }
                        code => builder.start(code),
                    }
                    started = true;
                }
                ProtocolEvent::PutObject(put) => match DataKind::from_wire(&put.kind) {
                    Some(kind) => builder.add_put(kind, &put.key, put.version, put.object),
                    None => {
                        log::debug!(target: "eppo", kind = put.kind.as_str(), key = put.key.as_str(); "ignoring put of unknown kind");
                    }
                },
                ProtocolEvent::DeleteObject(delete) => match DataKind::from_wire(&delete.kind) {
                    Some(kind) => builder.add_delete(kind, &delete.key, delete.version),
                    None => {
                        log::debug!(target: "eppo", kind = delete.kind.as_str(), key = delete.key.as_str(); "ignoring delete of unknown kind");
                    }
                },
                ProtocolEvent::PayloadTransferred(payload) => {
                    if !started {
                        return Err(Error::Protocol(
                            "payload transferred before server intent".to_owned(),
                        ));
                    }
                    return builder.finish(payload.selector());
                }
                ProtocolEvent::Error(error) => {
                    return Err(Error::Protocol(format!(
                        "server reported an error: {}",
                        error.reason
                    )));
                }
                ProtocolEvent::Goodbye(goodbye) => {
                    log::info!(target: "eppo", "server said goodbye: {}", goodbye.reason);
                }
                ProtocolEvent::Heartbeat => {}
                ProtocolEvent::Unknown(name) => {
                    log::debug!(target: "eppo", "ignoring unknown event \"{name}\"");
                }
            }
        }

        Err(Error::Protocol(
            "response ended before the payload was transferred".to_owned(),
        ))
    }
}
