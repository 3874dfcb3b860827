//! JSON frames exchanged over the socket.
//!
//! Clients send [`InboundFrame`]s (`chat` or `typing`). The server pushes
//! [`OutboundFrame`]s: either a message frame with the same shape, or a
//! `status_update` presence frame that clients never send.

use crate::store::{ChatMessage, MessageId, MessageType, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A frame as decoded from a client. `sender_id` and `created_at` are accepted
/// but ignored; the server stamps both.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub message_type: MessageType,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub recipient_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A chat or typing frame pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub message_type: MessageType,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageFrame {
    pub fn typing(sender_id: UserId, recipient_id: UserId, content: String) -> Self {
        Self {
            id: None,
            message_type: MessageType::Typing,
            sender_id,
            recipient_id,
            content,
            created_at: Utc::now(),
            read_at: None,
        }
    }
}

impl From<ChatMessage> for MessageFrame {
    fn from(message: ChatMessage) -> Self {
        Self {
            id: Some(message.id),
            message_type: MessageType::Chat,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            created_at: message.created_at,
            read_at: message.read_at,
        }
    }
}

/// A presence transition, serialized with `"type": "status_update"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "status_update")]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub username: String,
    pub is_online: bool,
    /// RFC 3339, or empty when the user has never been seen.
    pub last_seen: String,
}

/// Everything a connection's writer loop can put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Message(MessageFrame),
    Status(StatusUpdate),
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<MessageFrame> for OutboundFrame {
    fn from(frame: MessageFrame) -> Self {
        OutboundFrame::Message(frame)
    }
}

impl From<StatusUpdate> for OutboundFrame {
    fn from(update: StatusUpdate) -> Self {
        OutboundFrame::Status(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn decodes_minimal_chat_frame() {
        let frame =
            InboundFrame::decode(r#"{"message_type":"chat","recipient_id":2,"content":"hi"}"#)
                .unwrap();
        assert_eq!(frame.message_type, MessageType::Chat);
        assert_eq!(frame.recipient_id, 2);
        assert_eq!(frame.content, "hi");
        assert_eq!(frame.sender_id, None);
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert!(InboundFrame::decode(r#"{"message_type":"shout","recipient_id":2}"#).is_err());
        assert!(InboundFrame::decode("not json").is_err());
    }

    #[test]
    fn status_update_carries_type_tag() {
        let frame = OutboundFrame::from(StatusUpdate {
            user_id: 4,
            username: "dora".into(),
            is_online: false,
            last_seen: "2024-05-01T10:00:00+00:00".into(),
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "status_update",
                "user_id": 4,
                "username": "dora",
                "is_online": false,
                "last_seen": "2024-05-01T10:00:00+00:00",
            })
        );
    }

    #[test]
    fn message_frame_omits_absent_optional_fields() {
        let frame = OutboundFrame::from(MessageFrame::typing(1, 2, String::new()));
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["message_type"], "typing");
        assert!(value.get("id").is_none());
        assert!(value.get("read_at").is_none());
    }
}
