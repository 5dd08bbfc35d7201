use crate::{Change, ChangeSet, ChangeSetType, Selector};

use super::events::{IntentCode, ProtocolEvent, ServerIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ProtocolState {
    /// No server intent has been received yet.
    #[default]
    Inactive,
    /// Receiving incremental changes.
    Changes,
    /// Receiving a full data set.
    Full,
}

/// Kind of a condition that the handler could not process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalErrorKind {
    /// Event name is not part of the protocol vocabulary known to this SDK.
    UnknownEvent,
    /// Server intent did not contain any payload.
    MissingPayload,
    /// Event data could not be decoded.
    JsonError,
    /// Server violated the protocol (e.g., transferred a payload without declaring an intent).
    ProtocolError,
    /// Reached a case that should be unreachable. Indicates a bug or an SDK that is too old.
    ImplementationError,
}

/// What the owner of a [`ProtocolHandler`] should do after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolAction {
    /// A change set is complete and should be applied.
    ChangeSet(ChangeSet),
    /// Server reported an error. Changes received since the last intent or payload were dropped
    /// and the server is expected to resend them. The connection should be kept.
    Error { id: String, reason: String },
    /// Server is about to close the connection.
    Goodbye { reason: String },
    /// The event could not be processed.
    InternalError {
        kind: InternalErrorKind,
        message: String,
    },
    /// Nothing to do.
    NoAction,
}

impl ProtocolAction {
    fn internal_error(kind: InternalErrorKind, message: impl Into<String>) -> ProtocolAction {
        ProtocolAction::InternalError {
            kind,
            message: message.into(),
        }
    }
}

/// Per-connection state machine turning a sequence of protocol events into change sets.
///
/// The handler does not perform any I/O, so the same handler is used by every streaming
/// transport. Create a new handler (or call [`ProtocolHandler::reset`]) for every connection.
#[derive(Debug, Default)]
pub struct ProtocolHandler {
    state: ProtocolState,
    changes: Vec<Change>,
    origin_id: Option<String>,
}

impl ProtocolHandler {
    pub fn new() -> ProtocolHandler {
        ProtocolHandler::default()
    }

    /// Forget the current intent and any accumulated changes.
    pub fn reset(&mut self) {
        self.state = ProtocolState::Inactive;
        self.changes.clear();
        self.origin_id = None;
    }

    /// Decode an event from its wire representation and process it. Decoding failures are
    /// reported as [`InternalErrorKind::JsonError`].
    pub fn handle_raw(&mut self, name: &str, data: &str) -> ProtocolAction {
        match ProtocolEvent::parse(name, data) {
            Ok(event) => self.handle_event(event),
            Err(err) => ProtocolAction::internal_error(
                InternalErrorKind::JsonError,
                format!("failed to decode \"{name}\" event: {err}"),
            ),
        }
    }

    pub fn handle_event(&mut self, event: ProtocolEvent) -> ProtocolAction {
        match event {
            ProtocolEvent::ServerIntent(intent) => self.server_intent(intent),
            ProtocolEvent::PutObject(put) => {
                match put.to_change() {
                    Some(change) => self.changes.push(change),
                    None => {
                        log::debug!(target: "eppo", kind = put.kind.as_str(), key = put.key.as_str(); "ignoring put of unknown kind");
                    }
                }
                ProtocolAction::NoAction
            }
            ProtocolEvent::DeleteObject(delete) => {
                match delete.to_change() {
                    Some(change) => self.changes.push(change),
                    None => {
                        log::debug!(target: "eppo", kind = delete.kind.as_str(), key = delete.key.as_str(); "ignoring delete of unknown kind");
                    }
                }
                ProtocolAction::NoAction
            }
            ProtocolEvent::PayloadTransferred(payload) => {
                let change_set_type = match self.state {
                    ProtocolState::Inactive => {
                        return ProtocolAction::internal_error(
                            InternalErrorKind::ProtocolError,
                            "payload transferred before server intent",
                        );
                    }
                    ProtocolState::Full => ChangeSetType::Full,
                    ProtocolState::Changes => ChangeSetType::Partial,
                };
                let changes = std::mem::take(&mut self.changes);
                self.state = ProtocolState::Changes;
                ProtocolAction::ChangeSet(self.change_set(
                    change_set_type,
                    changes,
                    payload.selector(),
                ))
            }
            ProtocolEvent::Error(error) => {
                // Only the partial payload is dropped. The server resends it within the same
                // intent, so the state is kept.
                self.changes.clear();
                ProtocolAction::Error {
                    id: error.id,
                    reason: error.reason,
                }
            }
            ProtocolEvent::Goodbye(goodbye) => ProtocolAction::Goodbye {
                reason: goodbye.reason,
            },
            ProtocolEvent::Heartbeat => ProtocolAction::NoAction,
            ProtocolEvent::Unknown(name) => ProtocolAction::internal_error(
                InternalErrorKind::UnknownEvent,
                format!("received unknown event \"{name}\""),
            ),
        }
    }

    fn server_intent(&mut self, intent: ServerIntent) -> ProtocolAction {
        // Only the first payload is honored. The protocol allows several, but this SDK only ever
        // requests one.
        let Some(payload) = intent.payloads.into_iter().next() else {
            return ProtocolAction::internal_error(
                InternalErrorKind::MissingPayload,
                "server intent does not contain any payload",
            );
        };

        self.origin_id = Some(payload.id).filter(|id| !id.is_empty());
        match payload.intent_code {
            IntentCode::None => {
                self.changes.clear();
                self.state = ProtocolState::Changes;
                ProtocolAction::ChangeSet(self.change_set(
                    ChangeSetType::None,
                    Vec::new(),
                    Selector::empty(),
                ))
            }
            IntentCode::TransferFull => {
                self.changes.clear();
                self.state = ProtocolState::Full;
                ProtocolAction::NoAction
            }
            IntentCode::TransferChanges => {
                self.changes.clear();
                self.state = ProtocolState::Changes;
                ProtocolAction::NoAction
            }
            IntentCode::Unknown => ProtocolAction::internal_error(
                InternalErrorKind::ImplementationError,
                "unhandled intent code",
            ),
        }
    }

    fn change_set(
        &self,
        change_set_type: ChangeSetType,
        changes: Vec<Change>,
        selector: Selector,
    ) -> ChangeSet {
        let change_set = ChangeSet::new(change_set_type, changes, selector);
        match &self.origin_id {
            Some(origin_id) => change_set.with_origin_id(origin_id.as_str()),
            None => change_set,
        }
    }
}
