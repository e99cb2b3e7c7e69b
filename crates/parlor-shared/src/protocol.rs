//! JSON wire protocol for the push channel.
//!
//! Frames are tagged JSON objects (`{"type": ..., "payload": ...}`) sent as
//! WebSocket text messages.  Inbound frames multiplex the personal message
//! and typing queues; outbound frames carry subscriptions and the
//! best-effort publish destinations.

use serde::{Deserialize, Serialize};

use crate::types::{ChatId, Message, MessageId, MessageRequest, TypingIndicator};

/// The server-side queues a client subscribes to after connecting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushQueue {
    Messages,
    Typing,
}

/// Frames delivered by the server over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerFrame {
    /// A newly created message (personal message queue).
    Message(Message),

    /// A typing signal (personal typing queue).
    Typing(TypingIndicator),
}

/// Frames published by the client over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Subscribe to one of the personal queues.  Sent exactly once per queue
    /// per connection, re-sent after every reconnect.
    #[serde(rename_all = "camelCase")]
    Subscribe { queue: PushQueue },

    /// Publish a message create directly.  The engine sends creates over the
    /// request-reply API instead; see `ChatEngine::send_message`.
    SendMessage(MessageRequest),

    /// Typing signal, inherently lossy.
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: ChatId, is_typing: bool },

    /// Read receipt for a single message.
    #[serde(rename_all = "camelCase")]
    MarkRead { message_id: MessageId },
}

impl ServerFrame {
    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON text frame.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl ClientFrame {
    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON text frame.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKind, MessageStatus, UserId};

    #[test]
    fn test_server_frame_roundtrip() {
        let frame = ServerFrame::Typing(TypingIndicator {
            chat_id: ChatId::new("c1"),
            user_id: UserId::new("u1"),
            user_name: "Ana".into(),
            is_typing: true,
        });

        let text = frame.to_json().unwrap();
        let restored = ServerFrame::from_json(&text).unwrap();
        assert_eq!(frame, restored);
    }

    #[test]
    fn test_client_frame_tags_are_camel_case() {
        let text = ClientFrame::MarkRead {
            message_id: MessageId::new("m7"),
        }
        .to_json()
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "markRead");
        assert_eq!(value["payload"]["messageId"], "m7");

        let text = ClientFrame::Subscribe {
            queue: PushQueue::Typing,
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["payload"]["queue"], "typing");
    }

    #[test]
    fn test_message_frame_carries_full_payload() {
        let json = r#"{
            "type": "message",
            "payload": {
                "id": "m1",
                "chatId": "c1",
                "senderId": "u1",
                "content": "hi",
                "type": "TEXT",
                "timestamp": "2024-06-01T12:00:00Z",
                "status": "SENT"
            }
        }"#;

        match ServerFrame::from_json(json).unwrap() {
            ServerFrame::Message(m) => {
                assert_eq!(m.kind, MessageKind::Text);
                assert_eq!(m.status, MessageStatus::Sent);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
