//! Persistence contracts consumed by the gateway.
//!
//! Users, groups and messages live in an external store; the gateway only
//! talks to it through these traits. Every write method is a commit: it either
//! persists completely or returns [`StoreError`] and leaves nothing behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::group::Group;
use crate::message::{Message, MessageId};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write could not be committed.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// The store did not answer in time.
    #[error("Store timed out")]
    Timeout,

    /// The store is unreachable or broken.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// The part of an account this layer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Display name shown in notifications.
    pub known_as: String,
}

impl User {
    #[must_use]
    pub fn new(username: impl Into<String>, known_as: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            known_as: known_as.into(),
        }
    }
}

/// Account lookup.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find a user by name, ignoring ASCII case.
    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
}

/// Durable conversation groups.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>, StoreError>;

    /// The group that currently lists `connection_id`, if any.
    async fn group_for_connection(&self, connection_id: &str)
        -> Result<Option<Group>, StoreError>;

    /// Persist the group as given, creating it if it does not exist yet.
    async fn save_group(&self, group: &Group) -> Result<(), StoreError>;
}

/// Durable direct messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message and return it with its assigned id.
    async fn add_message(&self, message: Message) -> Result<Message, StoreError>;

    /// Messages between `viewer` and `other` visible to `viewer`, oldest first.
    async fn thread(&self, viewer: &str, other: &str) -> Result<Vec<Message>, StoreError>;

    /// Set `read_at` on every listed message in one batch.
    async fn mark_read(&self, ids: &[MessageId], at: DateTime<Utc>) -> Result<(), StoreError>;
}
