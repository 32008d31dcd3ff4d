//! Connection hub for Duet.
//!
//! The hub owns one bounded outbound queue per open connection and the
//! transport-level group membership used for fan-out. Socket tasks drain
//! their queue; everyone else pushes frames through the [`Transport`] impl.

use crate::transport::{DeliveryError, Transport};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use duet_protocol::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Maximum connections reached.
    #[error("Maximum connections reached ({0})")]
    ConnectionLimit(usize),

    /// A connection with this id is already registered.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of simultaneously open connections.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            outbound_capacity: 1024,
        }
    }
}

/// Receiving end of a connection's outbound queue.
pub type Outbound = mpsc::Receiver<Arc<Frame>>;

/// Registry of open connections and their transport groups.
pub struct Hub {
    /// Outbound queues indexed by connection id.
    connections: DashMap<String, mpsc::Sender<Arc<Frame>>>,
    /// Group name -> member connection ids.
    groups: DashMap<String, DashSet<String>>,
    /// Connection id -> joined group names.
    memberships: DashMap<String, DashSet<String>>,
    config: HubConfig,
}

impl Hub {
    /// Create a new hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            groups: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Open an outbound queue for a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is taken or the connection limit is reached.
    pub fn register(&self, connection_id: &str) -> Result<Outbound, HubError> {
        if self.connections.len() >= self.config.max_connections {
            return Err(HubError::ConnectionLimit(self.config.max_connections));
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        match self.connections.entry(connection_id.to_string()) {
            Entry::Occupied(_) => {
                Err(HubError::DuplicateConnection(connection_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
                debug!(connection = %connection_id, "Connection registered");
                Ok(rx)
            }
        }
    }

    /// Drop a connection's queue and remove it from every group.
    pub fn unregister(&self, connection_id: &str) {
        self.connections.remove(connection_id);

        if let Some((_, groups)) = self.memberships.remove(connection_id) {
            for group in groups.iter() {
                self.remove_member(group.key(), connection_id);
            }
        }

        debug!(connection = %connection_id, "Connection unregistered");
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_count: self.connections.len(),
            group_count: self.groups.len(),
        }
    }

    #[must_use]
    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Connection ids currently in a transport group.
    #[must_use]
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|members| members.iter().map(|id| id.key().clone()).collect())
            .unwrap_or_default()
    }

    fn remove_member(&self, group: &str, connection_id: &str) {
        if let Some(members) = self.groups.get(group) {
            members.remove(connection_id);
            let now_empty = members.is_empty();
            drop(members); // Release the shard lock before removing
            if now_empty {
                self.groups.remove_if(group, |_, members| members.is_empty());
                debug!(group = %group, "Deleted empty transport group");
            }
        }
    }

    fn deliver(&self, connection_id: &str, frame: Arc<Frame>) -> Result<(), DeliveryError> {
        let Some(tx) = self.connections.get(connection_id) else {
            return Err(DeliveryError::UnknownConnection(connection_id.to_string()));
        };

        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull(connection_id.to_string()),
            TrySendError::Closed(_) => DeliveryError::Closed(connection_id.to_string()),
        })
    }

    fn fan_out<'a>(
        &self,
        connection_ids: impl IntoIterator<Item = &'a String>,
        frame: Frame,
    ) -> Result<usize, DeliveryError> {
        let frame = Arc::new(frame);
        let mut total = 0;
        let mut delivered = 0;

        for id in connection_ids {
            total += 1;
            match self.deliver(id, Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(connection = %id, error = %e, "Fan-out delivery failed"),
            }
        }

        if delivered < total {
            return Err(DeliveryError::Partial { delivered, total });
        }
        Ok(delivered)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for Hub {
    async fn join_group(&self, connection_id: &str, group: &str) -> Result<(), DeliveryError> {
        if !self.connections.contains_key(connection_id) {
            return Err(DeliveryError::UnknownConnection(connection_id.to_string()));
        }

        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());
        self.memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(group.to_string());

        debug!(group = %group, connection = %connection_id, "Joined transport group");
        Ok(())
    }

    async fn leave_group(&self, connection_id: &str, group: &str) {
        if let Some(groups) = self.memberships.get(connection_id) {
            groups.remove(group);
        }
        self.remove_member(group, connection_id);
    }

    async fn send_to_group(&self, group: &str, frame: Frame) -> Result<usize, DeliveryError> {
        let members = self.group_members(group);
        let result = self.fan_out(&members, frame);
        trace!(group = %group, members = members.len(), "Sent to group");
        result
    }

    async fn send_to_connections(
        &self,
        connection_ids: &[String],
        frame: Frame,
    ) -> Result<usize, DeliveryError> {
        self.fan_out(connection_ids, frame)
    }

    async fn send_to_connection(
        &self,
        connection_id: &str,
        frame: Frame,
    ) -> Result<(), DeliveryError> {
        self.deliver(connection_id, Arc::new(frame))
    }

    async fn send_to_all(&self, frame: Frame, except: Option<&str>) -> usize {
        let frame = Arc::new(frame);
        self.connections
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != except)
            .filter(|entry| entry.value().try_send(Arc::clone(&frame)).is_ok())
            .count()
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Number of open connections.
    pub connection_count: usize,
    /// Number of non-empty transport groups.
    pub group_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_fan_out() {
        let hub = Hub::new();
        let mut rx1 = hub.register("c1").unwrap();
        let mut rx2 = hub.register("c2").unwrap();
        let mut rx3 = hub.register("c3").unwrap();

        hub.join_group("c1", "amy-bob").await.unwrap();
        hub.join_group("c2", "amy-bob").await.unwrap();

        let sent = hub.send_to_group("amy-bob", Frame::ack(1)).await.unwrap();
        assert_eq!(sent, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_unknown_connection_fails() {
        let hub = Hub::new();
        assert!(matches!(
            hub.join_group("ghost", "amy-bob").await,
            Err(DeliveryError::UnknownConnection(_))
        ));
        assert_eq!(hub.stats().group_count, 0);
    }

    #[tokio::test]
    async fn test_unregister_leaves_all_groups() {
        let hub = Hub::new();
        let _rx = hub.register("c1").unwrap();
        hub.join_group("c1", "amy-bob").await.unwrap();
        hub.join_group("c1", "amy-carl").await.unwrap();

        hub.unregister("c1");

        let stats = hub.stats();
        assert_eq!(stats.connection_count, 0);
        assert_eq!(stats.group_count, 0);
        assert_eq!(hub.send_to_group("amy-bob", Frame::ack(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leave_group_keeps_connection() {
        let hub = Hub::new();
        let mut rx = hub.register("c1").unwrap();
        hub.join_group("c1", "amy-bob").await.unwrap();
        hub.leave_group("c1", "amy-bob").await;

        assert!(hub.group_members("amy-bob").is_empty());
        hub.send_to_connection("c1", Frame::ack(2)).await.unwrap();
        assert_eq!(*rx.try_recv().unwrap(), Frame::ack(2));
    }

    #[tokio::test]
    async fn test_partial_delivery_reported() {
        let hub = Hub::new();
        let mut rx = hub.register("c1").unwrap();
        let ids = vec!["c1".to_string(), "gone".to_string()];

        match hub.send_to_connections(&ids, Frame::ack(3)).await {
            Err(DeliveryError::Partial { delivered, total }) => {
                assert_eq!((delivered, total), (1, 2));
            }
            other => panic!("Expected partial delivery, got {:?}", other),
        }
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_is_a_delivery_failure() {
        let hub = Hub::with_config(HubConfig {
            max_connections: 10,
            outbound_capacity: 1,
        });
        let _rx = hub.register("c1").unwrap();

        hub.send_to_connection("c1", Frame::ack(1)).await.unwrap();
        assert!(matches!(
            hub.send_to_connection("c1", Frame::ack(2)).await,
            Err(DeliveryError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_all_skips_sender() {
        let hub = Hub::new();
        let mut rx1 = hub.register("c1").unwrap();
        let mut rx2 = hub.register("c2").unwrap();

        let sent = hub
            .send_to_all(Frame::UserIsOnline { username: "amy".into() }, Some("c1"))
            .await;
        assert_eq!(sent, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_register_limits() {
        let hub = Hub::with_config(HubConfig {
            max_connections: 1,
            outbound_capacity: 8,
        });
        let _rx = hub.register("c1").unwrap();
        assert!(matches!(
            hub.register("c2"),
            Err(HubError::ConnectionLimit(1))
        ));

        hub.unregister("c1");
        let _rx = hub.register("c2").unwrap();

        let roomy = Hub::new();
        let _rx = roomy.register("c1").unwrap();
        assert!(matches!(
            roomy.register("c1"),
            Err(HubError::DuplicateConnection(_))
        ));
    }
}
