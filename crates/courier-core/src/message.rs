//! Message envelope and its JSON wire form.
//!
//! The wire object carries `sender_id`, `recipient_id`, `content`,
//! `timestamp` and `message_type`; anything else (read receipts, threading,
//! attachments, ...) is kept as opaque metadata and passed through untouched.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DecodeError;
use crate::ids::{MessageId, Principal};

const EDIT_TIMESTAMP: &str = "edit_timestamp";
const DELETE_TIMESTAMP: &str = "delete_timestamp";
const REACTIONS: &str = "reactions";
/// Metadata key holding the id a client attached to its own frame.
pub const CLIENT_ID: &str = "client_id";

/// JSON object exchanged with clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Kind tag plus the kind-specific payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Edit { edited_at: Option<String> },
    Delete { deleted_at: Option<String> },
    Reaction { reaction: Option<String> },
    System,
    /// Tag the relay does not know; carried verbatim.
    Other(String),
}

impl MessageKind {
    pub fn tag(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::Reaction { .. } => "reaction",
            Self::System => "system",
            Self::Other(tag) => tag.as_str(),
        }
    }

    /// Build the kind from its tag, lifting the kind-specific field out of
    /// `metadata`.
    fn extract(tag: Option<&str>, metadata: &mut Map<String, Value>) -> Self {
        let mut take = |key: &str| match metadata.remove(key) {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                // Not ours to interpret; leave it in the metadata.
                metadata.insert(key.to_owned(), other);
                None
            }
            None => None,
        };
        match tag.map(str::trim).filter(|t| !t.is_empty()) {
            None | Some("text") => Self::Text,
            Some("edit") => Self::Edit { edited_at: take(EDIT_TIMESTAMP) },
            Some("delete") => Self::Delete { deleted_at: take(DELETE_TIMESTAMP) },
            Some("reaction") => Self::Reaction { reaction: take(REACTIONS) },
            Some("system") => Self::System,
            Some(other) => Self::Other(other.to_owned()),
        }
    }

    fn restore(&self, metadata: &mut Map<String, Value>) {
        let (key, value) = match self {
            Self::Edit { edited_at: Some(v) } => (EDIT_TIMESTAMP, v),
            Self::Delete { deleted_at: Some(v) } => (DELETE_TIMESTAMP, v),
            Self::Reaction { reaction: Some(v) } => (REACTIONS, v),
            _ => return,
        };
        metadata.insert(key.to_owned(), Value::String(value.clone()));
    }
}

/// Immutable routed record. `content` is never interpreted by the relay.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Principal,
    pub recipient: Principal,
    pub content: String,
    pub timestamp: String,
    pub kind: MessageKind,
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(
        sender: impl Into<Principal>,
        recipient: impl Into<Principal>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            timestamp: now_rfc3339(),
            kind,
            metadata: Map::new(),
        }
    }

    /// Decode a raw inbound frame.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        let wire: WireMessage =
            serde_json::from_value(value).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        Ok(Self::from_wire(wire))
    }

    /// The relay always assigns the id; a client-supplied one is moved to
    /// `client_id` metadata. A missing timestamp is stamped here.
    pub fn from_wire(mut wire: WireMessage) -> Self {
        let kind = MessageKind::extract(wire.message_type.as_deref(), &mut wire.metadata);
        if let Some(client_id) = wire.id.filter(|id| !id.trim().is_empty()) {
            wire.metadata.insert(CLIENT_ID.to_owned(), Value::String(client_id));
        }
        let timestamp = if wire.timestamp.trim().is_empty() {
            now_rfc3339()
        } else {
            wire.timestamp
        };
        Self {
            id: MessageId::new(),
            sender: Principal::new(wire.sender_id),
            recipient: Principal::new(wire.recipient_id),
            content: wire.content,
            timestamp,
            kind,
            metadata: wire.metadata,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        let mut metadata = self.metadata.clone();
        self.kind.restore(&mut metadata);
        WireMessage {
            id: Some(self.id.to_string()),
            sender_id: self.sender.to_string(),
            recipient_id: self.recipient.to_string(),
            content: self.content.clone(),
            timestamp: self.timestamp.clone(),
            message_type: Some(self.kind.tag().to_owned()),
            metadata,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_wire())
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_json(value: Value) -> Message {
        Message::decode(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn decode_basic_text_message() {
        let msg = decode_json(json!({
            "sender_id": "u2",
            "recipient_id": "u1",
            "content": "hi",
            "timestamp": "2026-01-01T00:00:00Z",
            "message_type": "text"
        }));
        assert_eq!(msg.sender.as_str(), "u2");
        assert_eq!(msg.recipient.as_str(), "u1");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.timestamp, "2026-01-01T00:00:00Z");
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn missing_type_defaults_to_text() {
        let msg = decode_json(json!({"recipient_id": "u1", "content": "x"}));
        assert_eq!(msg.kind, MessageKind::Text);
    }

    #[test]
    fn missing_timestamp_and_id_are_assigned() {
        let msg = decode_json(json!({"recipient_id": "u1"}));
        assert!(!msg.timestamp.is_empty());
        assert!(msg.id.as_str().starts_with("msg_"));
    }

    #[test]
    fn client_supplied_id_moves_to_metadata() {
        let a = decode_json(json!({"id": "1", "recipient_id": "u1"}));
        let b = decode_json(json!({"id": "1", "recipient_id": "u2"}));
        assert!(a.id.as_str().starts_with("msg_"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.metadata[CLIENT_ID], "1");

        let out: Value = serde_json::from_str(&a.encode().unwrap()).unwrap();
        assert_eq!(out["client_id"], "1");
        assert_eq!(out["id"], a.id.as_str());
    }

    #[test]
    fn edit_kind_lifts_timestamp_out_of_metadata() {
        let msg = decode_json(json!({
            "recipient_id": "u1",
            "message_type": "edit",
            "edit_timestamp": "2026-01-02T00:00:00Z",
            "reply_to_id": "m1"
        }));
        assert_eq!(
            msg.kind,
            MessageKind::Edit { edited_at: Some("2026-01-02T00:00:00Z".into()) }
        );
        assert!(!msg.metadata.contains_key("edit_timestamp"));
        assert_eq!(msg.metadata["reply_to_id"], "m1");
    }

    #[test]
    fn reaction_and_delete_kinds() {
        let msg = decode_json(json!({"recipient_id": "u1", "message_type": "reaction", "reactions": "+1"}));
        assert_eq!(msg.kind, MessageKind::Reaction { reaction: Some("+1".into()) });

        let msg = decode_json(json!({"recipient_id": "u1", "message_type": "delete"}));
        assert_eq!(msg.kind, MessageKind::Delete { deleted_at: None });
    }

    #[test]
    fn non_string_kind_field_stays_in_metadata() {
        let msg = decode_json(json!({"recipient_id": "u1", "message_type": "reaction", "reactions": ["+1", "-1"]}));
        assert_eq!(msg.kind, MessageKind::Reaction { reaction: None });
        assert_eq!(msg.metadata["reactions"], json!(["+1", "-1"]));
    }

    #[test]
    fn unknown_kind_is_carried() {
        let msg = decode_json(json!({"recipient_id": "u1", "message_type": "poll"}));
        assert_eq!(msg.kind, MessageKind::Other("poll".into()));
        assert_eq!(msg.kind.tag(), "poll");
    }

    #[test]
    fn metadata_passes_through_encode() {
        let msg = decode_json(json!({
            "recipient_id": "u1",
            "content": "hello",
            "message_type": "edit",
            "edit_timestamp": "t1",
            "thread_id": "th-9",
            "attachment_url": "https://example.com/a.png"
        }));
        let out: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(out["thread_id"], "th-9");
        assert_eq!(out["attachment_url"], "https://example.com/a.png");
        assert_eq!(out["edit_timestamp"], "t1");
        assert_eq!(out["message_type"], "edit");
        assert_eq!(out["content"], "hello");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Message::decode(b"not json"), Err(DecodeError::InvalidJson(_))));
        assert_eq!(Message::decode(b"[1,2]"), Err(DecodeError::NotAnObject));
        assert_eq!(Message::decode(&[0xff, 0xfe]), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn decode_rejects_wrongly_typed_field() {
        let raw = json!({"recipient_id": 5}).to_string();
        assert!(matches!(Message::decode(raw.as_bytes()), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn missing_recipient_decodes_as_empty() {
        let msg = decode_json(json!({"content": "x"}));
        assert!(msg.recipient.is_empty());
    }
}
