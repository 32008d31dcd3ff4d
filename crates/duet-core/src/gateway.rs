//! Connection gateway for Duet.
//!
//! The gateway drives each connection through its lifecycle
//! (`Joining -> Joined -> Disconnected`) and owns the message send path. It
//! orchestrates the presence registry, the group and message stores and the
//! transport, but stores nothing itself.

use crate::group::{group_name, validate_username, Connection, Group};
use crate::identity::{ConnectionContext, IdentityResolver};
use crate::message::{Message, MessageId};
use crate::notify::NotificationDispatcher;
use crate::presence::PresenceRegistry;
use crate::store::{GroupStore, MessageStore, StoreError, UserStore};
use crate::transport::Transport;
use chrono::Utc;
use dashmap::DashMap;
use duet_protocol::{Frame, MessageDto};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The connection carries no resolvable identity.
    #[error("Authentication required")]
    Authentication,

    /// The request is malformed or not allowed.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A referenced user does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A store write or read failed.
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum message length in characters.
    pub max_content_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_content_length: 4096,
        }
    }
}

/// External services the gateway depends on.
#[derive(Clone)]
pub struct Services {
    pub identity: Arc<dyn IdentityResolver>,
    pub users: Arc<dyn UserStore>,
    pub groups: Arc<dyn GroupStore>,
    pub messages: Arc<dyn MessageStore>,
    pub transport: Arc<dyn Transport>,
}

/// A message send request from a connected client.
#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub recipient_username: String,
    pub content: String,
}

impl CreateMessage {
    #[must_use]
    pub fn new(recipient_username: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            recipient_username: recipient_username.into(),
            content: content.into(),
        }
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone)]
pub struct Joined {
    pub connection: Connection,
    /// Group snapshot right after the join.
    pub group: Group,
    /// Whether this was the user's first open connection.
    pub went_online: bool,
    /// The thread delivered to the caller, with unread messages now read.
    pub thread: Vec<MessageDto>,
}

/// Result of a disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnected {
    /// No group lists the connection; it never finished joining or has left.
    NotJoined,
    /// The group no longer lists the connection.
    AlreadyRemoved(Group),
    /// The connection was removed from its group.
    Left { group: Group, went_offline: bool },
}

/// Per-group critical sections, striped by group name.
#[derive(Default)]
struct GroupLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GroupLocks {
    async fn acquire(&self, name: &str) -> GroupGuard<'_> {
        let lock = Arc::clone(self.locks.entry(name.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        GroupGuard {
            locks: self,
            name: name.to_string(),
            guard: Some(guard),
        }
    }
}

struct GroupGuard<'a> {
    locks: &'a GroupLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map itself still references an idle lock.
        self.locks
            .locks
            .remove_if(&self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Orchestrates connection lifecycles and message sends.
pub struct Gateway {
    presence: Arc<PresenceRegistry>,
    services: Services,
    notifier: NotificationDispatcher,
    group_locks: GroupLocks,
    config: GatewayConfig,
}

impl Gateway {
    /// Create a gateway with default configuration.
    #[must_use]
    pub fn new(presence: Arc<PresenceRegistry>, services: Services) -> Self {
        Self::with_config(presence, services, GatewayConfig::default())
    }

    /// Create a gateway with custom configuration.
    #[must_use]
    pub fn with_config(
        presence: Arc<PresenceRegistry>,
        services: Services,
        config: GatewayConfig,
    ) -> Self {
        info!("Creating gateway with config: {:?}", config);
        Self {
            notifier: NotificationDispatcher::new(Arc::clone(&services.transport)),
            presence,
            services,
            group_locks: GroupLocks::default(),
            config,
        }
    }

    /// The presence registry this gateway keeps up to date.
    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Drop group entries whose connection presence no longer tracks.
    ///
    /// Live members are registered under the group lock right after their
    /// join is saved, so an untracked entry is one whose removal failed to
    /// persist.
    fn prune_stale(&self, group: &mut Group) {
        let stale: Vec<String> = group
            .connections()
            .iter()
            .filter(|c| !self.presence.is_tracked(&c.username, &c.connection_id))
            .map(|c| c.connection_id.clone())
            .collect();

        for connection_id in stale {
            group.remove(&connection_id);
            debug!(connection = %connection_id, group = %group.name(), "Pruned stale group entry");
        }
    }

    /// Join a freshly opened connection to its conversation group.
    ///
    /// Broadcasts `GroupUpdated` to the group, marks the caller's unread
    /// messages as read and sends `ReceivedMessageThread` and `OnlineUsers`
    /// to the caller.
    ///
    /// # Errors
    ///
    /// `Authentication` if no user is bound to the context, `Validation` if
    /// the peer parameter is missing or invalid, `Persistence` if joining the
    /// group or marking messages read fails.
    pub async fn connect(&self, context: &ConnectionContext) -> Result<Joined, GatewayError> {
        let connection_id = context.connection_id.as_str();

        let username = self
            .services
            .identity
            .current_username(context)
            .await
            .ok_or(GatewayError::Authentication)?;

        let peer = context
            .peer()
            .ok_or_else(|| GatewayError::Validation("missing peer parameter `user`".into()))?;
        validate_username(peer).map_err(|e| GatewayError::Validation(e.to_string()))?;

        // Prefer the stored spelling so both sides derive the same group name.
        let peer = match self.services.users.user_by_username(peer).await? {
            Some(user) => user.username,
            None => peer.to_string(),
        };

        let name = group_name(&username, &peer);
        let connection = Connection::new(connection_id, &username);
        debug!(connection = %connection_id, user = %username, group = %name, "Joining group");

        let (group, went_online) = {
            let _guard = self.group_locks.acquire(&name).await;

            let mut group = match self.services.groups.group_by_name(&name).await? {
                Some(group) => group,
                None => {
                    debug!(group = %name, "Creating group");
                    Group::new(&name)
                }
            };
            self.prune_stale(&mut group);
            group.add(connection.clone());
            self.services.groups.save_group(&group).await?;

            if let Err(e) = self.services.transport.join_group(connection_id, &name).await {
                warn!(connection = %connection_id, group = %name, error = %e, "Transport join failed");
            }
            let went_online = self.presence.register(&username, connection_id);

            // Still under the lock, so snapshots reach members in commit order.
            self.broadcast(&name, Frame::GroupUpdated(group.to_dto()))
                .await;
            (group, went_online)
        };

        if went_online {
            self.services
                .transport
                .send_to_all(
                    Frame::UserIsOnline {
                        username: username.clone(),
                    },
                    Some(connection_id),
                )
                .await;
        }

        let mut thread = self.services.messages.thread(&username, &peer).await?;
        let unread: Vec<MessageId> = thread
            .iter()
            .filter(|m| m.is_unread_for(&username))
            .map(|m| m.id)
            .collect();

        if !unread.is_empty() {
            let now = Utc::now();
            self.services.messages.mark_read(&unread, now).await?;
            for message in thread.iter_mut().filter(|m| m.is_unread_for(&username)) {
                message.read_at = Some(now);
            }
            debug!(connection = %connection_id, count = unread.len(), "Marked thread read");
        }

        let thread: Vec<MessageDto> = thread.iter().map(Message::to_dto).collect();
        self.send_to_caller(
            connection_id,
            Frame::ReceivedMessageThread {
                messages: thread.clone(),
            },
        )
        .await;
        self.send_to_caller(
            connection_id,
            Frame::OnlineUsers {
                usernames: self.presence.online_users(),
            },
        )
        .await;

        info!(connection = %connection_id, user = %username, group = %name, "Connection joined");

        Ok(Joined {
            connection,
            group,
            went_online,
            thread,
        })
    }

    /// Remove a closed connection from its group.
    ///
    /// Safe to call any number of times for the same id, and for connections
    /// that never finished joining.
    ///
    /// # Errors
    ///
    /// `Persistence` if the group store cannot be read or the removal cannot
    /// be saved. Presence and transport membership are cleaned up either way;
    /// the stored group keeps the stale entry until the next connect or
    /// disconnect on that group prunes it.
    pub async fn disconnect(&self, connection_id: &str) -> Result<Disconnected, GatewayError> {
        let Some(found) = self
            .services
            .groups
            .group_for_connection(connection_id)
            .await?
        else {
            debug!(connection = %connection_id, "Disconnect: no group holds this connection");
            return Ok(Disconnected::NotJoined);
        };

        let name = found.name().to_string();
        let guard = self.group_locks.acquire(&name).await;

        // Reload under the lock; membership may have changed since the lookup.
        let mut group = self
            .services
            .groups
            .group_by_name(&name)
            .await?
            .unwrap_or(found);

        let Some(connection) = group.remove(connection_id) else {
            debug!(connection = %connection_id, group = %name, "Disconnect: already removed");
            return Ok(Disconnected::AlreadyRemoved(group));
        };

        self.prune_stale(&mut group);
        self.services.transport.leave_group(connection_id, &name).await;
        let saved = self.services.groups.save_group(&group).await;
        let went_offline = self.presence.unregister(&connection.username, connection_id);

        if saved.is_ok() && !group.is_empty() {
            self.broadcast(&name, Frame::GroupUpdated(group.to_dto()))
                .await;
        }
        drop(guard);

        if went_offline {
            self.services
                .transport
                .send_to_all(
                    Frame::UserIsOffline {
                        username: connection.username.clone(),
                    },
                    Some(connection_id),
                )
                .await;
        }

        saved?;

        info!(connection = %connection_id, user = %connection.username, group = %name, "Connection left");

        Ok(Disconnected::Left {
            group,
            went_offline,
        })
    }

    /// Send a direct message from a joined connection.
    ///
    /// The message is delivered read if the recipient is viewing the
    /// conversation; otherwise the recipient's open connections are notified.
    /// Read status reflects presence at send time, not a delivery guarantee.
    ///
    /// # Errors
    ///
    /// `Validation` for self-messages or empty/oversized content, `NotFound`
    /// for unknown users, `Persistence` if the message cannot be stored (in
    /// which case nothing is broadcast).
    pub async fn send_message(
        &self,
        sender: &Connection,
        request: CreateMessage,
    ) -> Result<MessageDto, GatewayError> {
        let recipient_name = request.recipient_username.trim();

        if sender.username.to_lowercase() == recipient_name.to_lowercase() {
            return Err(GatewayError::Validation(
                "you cannot send messages to yourself".into(),
            ));
        }
        if request.content.trim().is_empty() {
            return Err(GatewayError::Validation("message content is empty".into()));
        }
        if request.content.chars().count() > self.config.max_content_length {
            return Err(GatewayError::Validation(format!(
                "message longer than {} characters",
                self.config.max_content_length
            )));
        }

        let recipient = self
            .services
            .users
            .user_by_username(recipient_name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("recipient {recipient_name}")))?;
        let author = self
            .services
            .users
            .user_by_username(&sender.username)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("sender {}", sender.username)))?;

        let sent_at = Utc::now();
        let mut message = Message::new(
            &author.username,
            &recipient.username,
            request.content,
            sent_at,
        );

        let name = group_name(&author.username, &recipient.username);
        let group = self.services.groups.group_by_name(&name).await?;

        if group.is_some_and(|g| g.has_user(&recipient.username)) {
            message = message.with_read_at(sent_at);
        } else {
            let ids: Vec<String> = self
                .presence
                .connections_for(&recipient.username)
                .into_iter()
                .collect();
            self.notifier.new_message_received(&ids, &author).await;
        }

        let message = self.services.messages.add_message(message).await?;
        let dto = message.to_dto();

        self.broadcast(&name, Frame::NewMessage(dto.clone())).await;

        debug!(
            connection = %sender.connection_id,
            group = %name,
            id = dto.id,
            read = dto.read_at.is_some(),
            "Message sent"
        );

        Ok(dto)
    }

    async fn broadcast(&self, group: &str, frame: Frame) {
        let event = frame.event_name().unwrap_or("frame");
        match self.services.transport.send_to_group(group, frame).await {
            Ok(delivered) => debug!(group = %group, event, delivered, "Broadcast"),
            Err(e) => warn!(group = %group, event, error = %e, "Broadcast incomplete"),
        }
    }

    async fn send_to_caller(&self, connection_id: &str, frame: Frame) {
        let event = frame.event_name().unwrap_or("frame");
        if let Err(e) = self
            .services
            .transport
            .send_to_connection(connection_id, frame)
            .await
        {
            warn!(connection = %connection_id, event, error = %e, "Send to caller failed");
        }
    }
}
