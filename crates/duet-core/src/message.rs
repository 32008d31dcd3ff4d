//! Direct messages.

use chrono::{DateTime, Utc};
use duet_protocol::MessageDto;
use serde::{Deserialize, Serialize};

/// A unique message identifier, assigned by the message store.
pub type MessageId = u64;

/// A direct message between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Zero until the message has been stored.
    pub id: MessageId,
    pub sender_username: String,
    pub recipient_username: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub sender_deleted: bool,
    pub recipient_deleted: bool,
}

impl Message {
    /// Create an unsent, unread message.
    #[must_use]
    pub fn new(
        sender_username: impl Into<String>,
        recipient_username: impl Into<String>,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            sender_username: sender_username.into(),
            recipient_username: recipient_username.into(),
            content: content.into(),
            sent_at,
            read_at: None,
            sender_deleted: false,
            recipient_deleted: false,
        }
    }

    /// Mark the message read at the given instant.
    #[must_use]
    pub fn with_read_at(mut self, at: DateTime<Utc>) -> Self {
        self.read_at = Some(at);
        self
    }

    /// Whether `username` received this message and has not read it yet.
    #[must_use]
    pub fn is_unread_for(&self, username: &str) -> bool {
        self.recipient_username == username && self.read_at.is_none()
    }

    /// Whether the message belongs to the thread between `viewer` and `other`,
    /// as seen by `viewer` (soft-deleted messages are hidden from the side that
    /// deleted them).
    #[must_use]
    pub fn in_thread_of(&self, viewer: &str, other: &str) -> bool {
        (self.sender_username == viewer
            && self.recipient_username == other
            && !self.sender_deleted)
            || (self.sender_username == other
                && self.recipient_username == viewer
                && !self.recipient_deleted)
    }

    #[must_use]
    pub fn to_dto(&self) -> MessageDto {
        MessageDto {
            id: self.id,
            sender_username: self.sender_username.clone(),
            recipient_username: self.recipient_username.clone(),
            content: self.content.clone(),
            sent_at: self.sent_at,
            read_at: self.read_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_only_for_recipient() {
        let message = Message::new("amy", "bob", "hi", Utc::now());
        assert!(message.is_unread_for("bob"));
        assert!(!message.is_unread_for("amy"));

        let read = message.clone().with_read_at(Utc::now());
        assert!(!read.is_unread_for("bob"));
        assert!(read.to_dto().read_at.is_some());
    }

    #[test]
    fn test_thread_visibility_respects_soft_delete() {
        let mut message = Message::new("amy", "bob", "hi", Utc::now());
        assert!(message.in_thread_of("amy", "bob"));
        assert!(message.in_thread_of("bob", "amy"));
        assert!(!message.in_thread_of("amy", "carl"));

        message.sender_deleted = true;
        assert!(!message.in_thread_of("amy", "bob"));
        assert!(message.in_thread_of("bob", "amy"));

        message.recipient_deleted = true;
        assert!(!message.in_thread_of("bob", "amy"));
    }
}
