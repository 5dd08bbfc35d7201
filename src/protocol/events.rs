//! Wire-level protocol event vocabulary.
use serde::{Deserialize, Serialize};

use crate::{Change, DataKind, Selector};

pub const SERVER_INTENT: &str = "server-intent";
pub const PUT_OBJECT: &str = "put-object";
pub const DELETE_OBJECT: &str = "delete-object";
pub const PAYLOAD_TRANSFERRED: &str = "payload-transferred";
pub const ERROR: &str = "error";
pub const GOODBYE: &str = "goodbye";
pub const HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentCode {
    /// Server has no changes for the SDK.
    #[serde(rename = "none")]
    None,
    /// Server is about to send a full data set.
    #[serde(rename = "xfer-full")]
    TransferFull,
    /// Server is about to send changes since the selector the SDK provided.
    #[serde(rename = "xfer-changes")]
    TransferChanges,
    /// An intent code this SDK does not know.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIntentPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub target: i64,
    pub intent_code: IntentCode,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIntent {
    pub payloads: Vec<ServerIntentPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutObject {
    pub kind: String,
    pub key: String,
    pub version: u64,
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteObject {
    pub kind: String,
    pub key: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadTransferred {
    pub state: String,
    pub version: i64,
}

impl PayloadTransferred {
    pub fn selector(&self) -> Selector {
        Selector::new(self.version, self.state.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goodbye {
    #[serde(default)]
    pub reason: String,
}

/// A decoded protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    ServerIntent(ServerIntent),
    PutObject(PutObject),
    DeleteObject(DeleteObject),
    PayloadTransferred(PayloadTransferred),
    Error(ErrorEvent),
    Goodbye(Goodbye),
    Heartbeat,
    /// An event name this SDK does not know.
    Unknown(String),
}

impl ProtocolEvent {
    /// Decode an event from its name and JSON data.
    ///
    /// Unknown event names are not an error: they decode to [`ProtocolEvent::Unknown`] and their
    /// data is not inspected.
    pub fn from_wire(name: &str, data: &serde_json::Value) -> serde_json::Result<ProtocolEvent> {
        let event = match name {
            SERVER_INTENT => ProtocolEvent::ServerIntent(ServerIntent::deserialize(data)?),
            PUT_OBJECT => ProtocolEvent::PutObject(PutObject::deserialize(data)?),
            DELETE_OBJECT => ProtocolEvent::DeleteObject(DeleteObject::deserialize(data)?),
            PAYLOAD_TRANSFERRED => {
                ProtocolEvent::PayloadTransferred(PayloadTransferred::deserialize(data)?)
            }
            ERROR => ProtocolEvent::Error(ErrorEvent::deserialize(data)?),
            GOODBYE => ProtocolEvent::Goodbye(Goodbye::deserialize(data)?),
            HEARTBEAT => ProtocolEvent::Heartbeat,
            other => ProtocolEvent::Unknown(other.to_owned()),
        };
        Ok(event)
    }

    /// Decode an event from its name and raw JSON text.
    pub fn parse(name: &str, data: &str) -> serde_json::Result<ProtocolEvent> {
        let data = match name {
            SERVER_INTENT | PUT_OBJECT | DELETE_OBJECT | PAYLOAD_TRANSFERRED | ERROR | GOODBYE
                if !data.trim().is_empty() =>
            {
                serde_json::from_str(data)?
            }
            // Heartbeats and unknown events carry nothing we need, so their data is not parsed.
            _ => serde_json::Value::Object(Default::default()),
        };
        ProtocolEvent::from_wire(name, &data)
    }

    /// Event name as used on the wire.
    pub fn name(&self) -> &str {
        match self {
            ProtocolEvent::ServerIntent(_) => SERVER_INTENT,
            ProtocolEvent::PutObject(_) => PUT_OBJECT,
            ProtocolEvent::DeleteObject(_) => DELETE_OBJECT,
            ProtocolEvent::PayloadTransferred(_) => PAYLOAD_TRANSFERRED,
            ProtocolEvent::Error(_) => ERROR,
            ProtocolEvent::Goodbye(_) => GOODBYE,
            ProtocolEvent::Heartbeat => HEARTBEAT,
            ProtocolEvent::Unknown(name) => name,
        }
    }
}

impl PutObject {
    /// Convert into a [`Change`]. Returns `None` for kinds this SDK does not know.
    pub fn to_change(&self) -> Option<Change> {
        let kind = DataKind::from_wire(&self.kind)?;
        Some(Change::put(kind, &self.key, self.version, self.object.clone()))
    }
}

impl DeleteObject {
    /// Convert into a [`Change`]. Returns `None` for kinds this SDK does not know.
    pub fn to_change(&self) -> Option<Change> {
        let kind = DataKind::from_wire(&self.kind)?;
        Some(Change::delete(kind, &self.key, self.version))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_server_intent() {
        let event = ProtocolEvent::from_wire(
            "server-intent",
            &json!({"payloads": [{"id": "p", "target": 3, "intentCode": "xfer-full", "reason": "cant-catchup"}]}),
        )
        .unwrap();

        let ProtocolEvent::ServerIntent(intent) = &event else {
            panic!("expected server-intent, got {event:?}");
        };
        assert_eq!(intent.payloads[0].intent_code, IntentCode::TransferFull);
        assert_eq!(intent.payloads[0].target, 3);
    }

    #[test]
    fn unknown_intent_code_decodes() {
        let event = ProtocolEvent::parse(
            "server-intent",
            r#"{"payloads": [{"intentCode": "xfer-something"}]}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            ProtocolEvent::ServerIntent(ServerIntent {
                payloads: vec![ServerIntentPayload {
                    id: String::new(),
                    target: 0,
                    intent_code: IntentCode::Unknown,
                    reason: String::new(),
                }]
            })
        );
    }

    #[test]
    fn unknown_event_name_is_not_an_error() {
        let event = ProtocolEvent::parse("new-fancy-event", "not even json").unwrap();
        assert_eq!(event, ProtocolEvent::Unknown("new-fancy-event".to_owned()));
        assert_eq!(event.name(), "new-fancy-event");
    }

    #[test]
    fn heartbeat_accepts_empty_data() {
        assert_eq!(
            ProtocolEvent::parse("heartbeat", "").unwrap(),
            ProtocolEvent::Heartbeat
        );
    }

    #[test]
    fn malformed_put_is_an_error() {
        assert!(ProtocolEvent::parse("put-object", r#"{"kind": "flag"}"#).is_err());
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let put = PutObject {
            kind: "experiment".to_owned(),
            key: "e".to_owned(),
            version: 1,
            object: json!({}),
        };
        assert_eq!(put.to_change(), None);
    }
}
