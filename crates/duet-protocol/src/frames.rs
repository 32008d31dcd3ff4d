//! Frame types for the Duet protocol.
//!
//! A frame is either a control frame (requests, acks, errors, keepalive) or
//! an event pushed by the server. Event frames are tagged with the event
//! name clients subscribe to, e.g. `GroupUpdated` or `NewMessage`.

use serde::{Deserialize, Serialize};

use crate::payload::{GroupDto, MessageDto, SenderSummary};

/// Current protocol version, announced in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    SendMessage = 0x01,
    Ack = 0x02,
    Error = 0x03,
    Ping = 0x04,
    Pong = 0x05,
    Connected = 0x06,
    GroupUpdated = 0x10,
    ReceivedMessageThread = 0x11,
    NewMessage = 0x12,
    NewMessageReceived = 0x13,
    UserIsOnline = 0x14,
    UserIsOffline = 0x15,
    OnlineUsers = 0x16,
}

impl FrameType {
    /// Whether frames of this type are server-pushed events.
    #[must_use]
    pub fn is_event(self) -> bool {
        (self as u8) >= 0x10
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Send a direct message to another user.
    #[serde(rename = "send_message")]
    SendMessage {
        /// Request ID for acknowledgment.
        id: u64,
        /// Who the message is for.
        #[serde(rename = "recipientUsername")]
        recipient_username: String,
        /// Message body.
        content: String,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Membership of a conversation group changed.
    GroupUpdated(GroupDto),

    /// Full message thread, sent to a connection right after it joins.
    ReceivedMessageThread { messages: Vec<MessageDto> },

    /// A message was sent inside a group the connection belongs to.
    NewMessage(MessageDto),

    /// Someone messaged this user outside the currently open conversation.
    NewMessageReceived(SenderSummary),

    UserIsOnline { username: String },

    UserIsOffline { username: String },

    /// Sorted snapshot of online usernames.
    OnlineUsers { usernames: Vec<String> },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::SendMessage { .. } => FrameType::SendMessage,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::GroupUpdated(_) => FrameType::GroupUpdated,
            Frame::ReceivedMessageThread { .. } => FrameType::ReceivedMessageThread,
            Frame::NewMessage(_) => FrameType::NewMessage,
            Frame::NewMessageReceived(_) => FrameType::NewMessageReceived,
            Frame::UserIsOnline { .. } => FrameType::UserIsOnline,
            Frame::UserIsOffline { .. } => FrameType::UserIsOffline,
            Frame::OnlineUsers { .. } => FrameType::OnlineUsers,
        }
    }

    /// Event name for server-pushed frames, `None` for control frames.
    #[must_use]
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            Frame::GroupUpdated(_) => Some("GroupUpdated"),
            Frame::ReceivedMessageThread { .. } => Some("ReceivedMessageThread"),
            Frame::NewMessage(_) => Some("NewMessage"),
            Frame::NewMessageReceived(_) => Some("NewMessageReceived"),
            Frame::UserIsOnline { .. } => Some("UserIsOnline"),
            Frame::UserIsOffline { .. } => Some("UserIsOffline"),
            Frame::OnlineUsers { .. } => Some("OnlineUsers"),
            _ => None,
        }
    }

    /// Create a new SendMessage frame.
    #[must_use]
    pub fn send_message(
        id: u64,
        recipient_username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Frame::SendMessage {
            id,
            recipient_username: recipient_username.into(),
            content: content.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ConnectionDto;

    #[test]
    fn test_event_names() {
        let group = Frame::GroupUpdated(GroupDto {
            name: "amy-bob".into(),
            connections: vec![],
        });
        assert_eq!(group.event_name(), Some("GroupUpdated"));
        assert!(group.frame_type().is_event());

        let ack = Frame::ack(3);
        assert_eq!(ack.event_name(), None);
        assert!(!ack.frame_type().is_event());
    }

    #[test]
    fn test_group_updated_wire_shape() {
        let frame = Frame::GroupUpdated(GroupDto {
            name: "amy-bob".into(),
            connections: vec![ConnectionDto {
                connection_id: "c1".into(),
                username: "amy".into(),
            }],
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "GroupUpdated");
        assert_eq!(value["name"], "amy-bob");
        assert_eq!(value["connections"][0]["connectionId"], "c1");
        assert_eq!(value["connections"][0]["username"], "amy");
    }

    #[test]
    fn test_notification_wire_shape() {
        let frame = Frame::NewMessageReceived(SenderSummary {
            username: "amy".into(),
            known_as: "Amy".into(),
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "NewMessageReceived");
        assert_eq!(value["username"], "amy");
        assert_eq!(value["knownAs"], "Amy");
    }

    #[test]
    fn test_send_message_from_client_json() {
        let raw = r#"{"type":"send_message","id":7,"recipientUsername":"bob","content":"hi"}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame, Frame::send_message(7, "bob", "hi"));
    }

    #[test]
    fn test_unread_message_omits_read_at() {
        let message = MessageDto {
            id: 1,
            sender_username: "amy".into(),
            recipient_username: "bob".into(),
            content: "hi".into(),
            sent_at: chrono::Utc::now(),
            read_at: None,
        };

        let value = serde_json::to_value(Frame::NewMessage(message)).unwrap();
        assert!(value.get("readAt").is_none());
        assert_eq!(value["senderUsername"], "amy");
    }
}
