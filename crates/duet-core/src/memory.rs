//! In-memory store implementations.
//!
//! Used by the standalone server and by tests. Writes can be made to fail on
//! demand to exercise the gateway's persistence error paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::group::Group;
use crate::message::{Message, MessageId};
use crate::store::{GroupStore, MessageStore, StoreError, User, UserStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// User directory keyed by lowercase username.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, User>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user, replacing any existing user with the same name.
    pub fn insert(&self, user: User) {
        lock(&self.users).insert(user.username.to_lowercase(), user);
    }

    #[must_use]
    pub fn with_user(self, user: User) -> Self {
        self.insert(user);
        self
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(lock(&self.users).get(&username.to_lowercase()).cloned())
    }
}

/// Group records keyed by group name.
#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    groups: Mutex<HashMap<String, Group>>,
    fail_writes: AtomicBool,
}

impl MemoryGroupStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save_group` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        lock(&self.groups).len()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>, StoreError> {
        Ok(lock(&self.groups).get(name).cloned())
    }

    async fn group_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<Group>, StoreError> {
        Ok(lock(&self.groups)
            .values()
            .find(|g| g.contains_connection(connection_id))
            .cloned())
    }

    async fn save_group(&self, group: &Group) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::CommitFailed(format!(
                "group {} not saved",
                group.name()
            )));
        }
        lock(&self.groups).insert(group.name().to_string(), group.clone());
        Ok(())
    }
}

/// Message log with sequential ids starting at 1.
#[derive(Debug)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<Message>>,
    next_id: AtomicU64,
    fail_writes: AtomicBool,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<Message> {
        lock(&self.messages).iter().find(|m| m.id == id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hide a message from `username`'s side of the thread.
    ///
    /// Returns `false` if the message does not exist or `username` is neither
    /// its sender nor its recipient. Once both sides have deleted it the
    /// message is dropped.
    pub fn delete_for(&self, id: MessageId, username: &str) -> bool {
        let mut messages = lock(&self.messages);
        let Some(index) = messages.iter().position(|m| m.id == id) else {
            return false;
        };

        let message = &mut messages[index];
        let mut touched = false;
        if message.sender_username == username {
            message.sender_deleted = true;
            touched = true;
        }
        if message.recipient_username == username {
            message.recipient_deleted = true;
            touched = true;
        }
        if message.sender_deleted && message.recipient_deleted {
            messages.remove(index);
        }
        touched
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::CommitFailed("message store rejected write".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn add_message(&self, mut message: Message) -> Result<Message, StoreError> {
        self.check_writable()?;
        message.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.messages).push(message.clone());
        Ok(message)
    }

    async fn thread(&self, viewer: &str, other: &str) -> Result<Vec<Message>, StoreError> {
        let mut thread: Vec<Message> = lock(&self.messages)
            .iter()
            .filter(|m| m.in_thread_of(viewer, other))
            .cloned()
            .collect();
        thread.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
        Ok(thread)
    }

    async fn mark_read(&self, ids: &[MessageId], at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_writable()?;
        for message in lock(&self.messages).iter_mut() {
            if ids.contains(&message.id) {
                message.read_at = Some(at);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Connection;
    use chrono::Duration;

    #[tokio::test]
    async fn test_user_lookup_ignores_case() {
        let users = MemoryUserStore::new().with_user(User::new("bob", "Bobby"));
        let found = users.user_by_username("BoB").await.unwrap();
        assert_eq!(found.map(|u| u.known_as), Some("Bobby".to_string()));
        assert!(users.user_by_username("carl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_save_and_lookup() {
        let store = MemoryGroupStore::new();
        let mut group = Group::new("amy-bob");
        group.add(Connection::new("c1", "amy"));
        store.save_group(&group).await.unwrap();

        let by_conn = store.group_for_connection("c1").await.unwrap().unwrap();
        assert_eq!(by_conn.name(), "amy-bob");
        assert!(store.group_for_connection("c9").await.unwrap().is_none());

        store.fail_writes(true);
        group.add(Connection::new("c2", "bob"));
        assert!(store.save_group(&group).await.is_err());
        let stored = store.group_by_name("amy-bob").await.unwrap().unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_thread_order_and_mark_read() {
        let store = MemoryMessageStore::new();
        let now = Utc::now();

        let later = store
            .add_message(Message::new("bob", "amy", "second", now))
            .await
            .unwrap();
        let earlier = store
            .add_message(Message::new("amy", "bob", "first", now - Duration::seconds(5)))
            .await
            .unwrap();
        store
            .add_message(Message::new("amy", "carl", "elsewhere", now))
            .await
            .unwrap();

        let thread = store.thread("amy", "bob").await.unwrap();
        let ids: Vec<_> = thread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);

        store.mark_read(&[later.id], now).await.unwrap();
        assert_eq!(store.get(later.id).unwrap().read_at, Some(now));
        assert!(store.get(earlier.id).unwrap().read_at.is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_hides_one_side() {
        let store = MemoryMessageStore::new();
        let message = store
            .add_message(Message::new("amy", "bob", "oops", Utc::now()))
            .await
            .unwrap();

        assert!(!store.delete_for(message.id, "carl"));
        assert!(store.delete_for(message.id, "amy"));
        assert!(store.thread("amy", "bob").await.unwrap().is_empty());
        assert_eq!(store.thread("bob", "amy").await.unwrap().len(), 1);

        assert!(store.delete_for(message.id, "bob"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_assigns_nothing() {
        let store = MemoryMessageStore::new();
        store.fail_writes(true);
        assert!(store
            .add_message(Message::new("amy", "bob", "lost", Utc::now()))
            .await
            .is_err());
        assert!(store.is_empty());
    }
}
