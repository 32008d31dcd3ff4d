//! Presence tracking for Duet.
//!
//! The registry maps each online username to the set of connection ids it
//! currently holds. A user is online while that set is non-empty; entries are
//! removed the moment their last connection goes away, so the map never holds
//! an empty set.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Process-wide registry of open connections per user.
///
/// Every operation takes the same lock, so register/unregister/list/lookup
/// are atomic relative to each other. The lock is never held across an await.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    online: Mutex<HashMap<String, HashSet<String>>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.online.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new connection for `username`.
    ///
    /// Returns `true` if the user had no open connections before this one.
    pub fn register(&self, username: &str, connection_id: &str) -> bool {
        let mut online = self.lock();
        let connections = online.entry(username.to_string()).or_default();
        let went_online = connections.is_empty();
        connections.insert(connection_id.to_string());
        drop(online);

        if went_online {
            debug!(user = %username, connection = %connection_id, "Presence: user online");
        }
        went_online
    }

    /// Stop tracking a connection for `username`.
    ///
    /// Returns `true` if this was the user's last open connection. Unknown
    /// users and connection ids are ignored.
    pub fn unregister(&self, username: &str, connection_id: &str) -> bool {
        let mut online = self.lock();
        let Some(connections) = online.get_mut(username) else {
            return false;
        };

        connections.remove(connection_id);
        if !connections.is_empty() {
            return false;
        }

        online.remove(username);
        drop(online);

        debug!(user = %username, connection = %connection_id, "Presence: user offline");
        true
    }

    /// Snapshot of online usernames, sorted ascending.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.lock().keys().cloned().collect();
        users.sort_unstable();
        users
    }

    /// Connection ids currently open for `username` (empty if offline).
    #[must_use]
    pub fn connections_for(&self, username: &str) -> HashSet<String> {
        self.lock().get(username).cloned().unwrap_or_default()
    }

    /// Whether `username` has at least one open connection.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.lock().contains_key(username)
    }

    /// Whether this exact connection is tracked for `username`.
    #[must_use]
    pub fn is_tracked(&self, username: &str, connection_id: &str) -> bool {
        self.lock()
            .get(username)
            .is_some_and(|connections| connections.contains(connection_id))
    }

    /// Number of users with at least one open connection.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.lock().len()
    }
}
