//! Conversation groups.
//!
//! A group is the durable record of a two-party conversation. Its name is
//! derived from both usernames so that either participant computes the same
//! key; its connection list is the set of sockets currently viewing it.

use duet_protocol::{ConnectionDto, GroupDto};
use serde::{Deserialize, Serialize};

/// Maximum username length accepted as a conversation peer.
pub const MAX_USERNAME_LENGTH: usize = 256;

/// Canonical group name for a conversation between `a` and `b`.
///
/// Ordinal comparison, smaller name first: `group_name(a, b) == group_name(b, a)`.
#[must_use]
pub fn group_name(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}-{second}")
}

/// Validate a peer username taken from request parameters.
///
/// # Errors
///
/// Returns an error message if the name is empty, too long, or contains
/// control characters.
pub fn validate_username(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("username cannot be empty");
    }
    if name.len() > MAX_USERNAME_LENGTH {
        return Err("username too long");
    }
    if name.chars().any(char::is_control) {
        return Err("username contains invalid characters");
    }
    Ok(())
}

/// One open client connection, bound to a single authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: String,
    pub username: String,
}

impl Connection {
    #[must_use]
    pub fn new(connection_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            username: username.into(),
        }
    }
}

impl From<&Connection> for ConnectionDto {
    fn from(connection: &Connection) -> Self {
        ConnectionDto {
            connection_id: connection.connection_id.clone(),
            username: connection.username.clone(),
        }
    }
}

/// A named conversation group and its current connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    name: String,
    connections: Vec<Connection>,
}

impl Group {
    /// Create an empty group.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connections: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Add a connection. Returns `false` if the connection id is already present.
    pub fn add(&mut self, connection: Connection) -> bool {
        if self.contains_connection(&connection.connection_id) {
            return false;
        }
        self.connections.push(connection);
        true
    }

    /// Remove a connection by id, returning it if it was present.
    pub fn remove(&mut self, connection_id: &str) -> Option<Connection> {
        let index = self
            .connections
            .iter()
            .position(|c| c.connection_id == connection_id)?;
        Some(self.connections.remove(index))
    }

    #[must_use]
    pub fn contains_connection(&self, connection_id: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.connection_id == connection_id)
    }

    /// Whether any connection in the group belongs to `username`.
    #[must_use]
    pub fn has_user(&self, username: &str) -> bool {
        self.connections.iter().any(|c| c.username == username)
    }

    /// Wire snapshot of the group.
    #[must_use]
    pub fn to_dto(&self) -> GroupDto {
        GroupDto {
            name: self.name.clone(),
            connections: self.connections.iter().map(ConnectionDto::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name_is_order_independent() {
        let pairs = [
            ("amy", "bob"),
            ("Bob", "amy"),
            ("same", "same"),
            ("", "x"),
            ("zoë", "zoe"),
        ];
        for (a, b) in pairs {
            assert_eq!(group_name(a, b), group_name(b, a));
        }
        assert_eq!(group_name("bob", "amy"), "amy-bob");
    }

    #[test]
    fn test_group_name_uses_ordinal_order() {
        // Uppercase sorts before lowercase in ordinal comparison.
        assert_eq!(group_name("amy", "Bob"), "Bob-amy");
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("bob").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("   ").is_err());
        assert!(validate_username("bo\nb").is_err());
        assert!(validate_username(&"a".repeat(MAX_USERNAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_group_membership() {
        let mut group = Group::new("amy-bob");
        assert!(group.add(Connection::new("c1", "amy")));
        assert!(!group.add(Connection::new("c1", "amy")));
        assert!(group.add(Connection::new("c2", "bob")));

        assert_eq!(group.len(), 2);
        assert!(group.has_user("bob"));

        assert_eq!(group.remove("c2"), Some(Connection::new("c2", "bob")));
        assert!(group.remove("c2").is_none());
        assert!(!group.has_user("bob"));

        let dto = group.to_dto();
        assert_eq!(dto.name, "amy-bob");
        assert_eq!(dto.connections[0].connection_id, "c1");
    }
}
