//! Out-of-conversation notifications.

use crate::store::User;
use crate::transport::{DeliveryError, Transport};
use duet_protocol::{Frame, SenderSummary};
use std::sync::Arc;
use tracing::{debug, warn};

/// Best-effort push of `NewMessageReceived` to a recipient's open connections.
#[derive(Clone)]
pub struct NotificationDispatcher {
    transport: Arc<dyn Transport>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Tell each listed connection that `sender` wrote to its user.
    ///
    /// Returns the number of connections reached. An empty id list makes no
    /// transport call. Delivery failures are logged, never returned.
    pub async fn new_message_received(&self, connection_ids: &[String], sender: &User) -> usize {
        if connection_ids.is_empty() {
            return 0;
        }

        let frame = Frame::NewMessageReceived(SenderSummary {
            username: sender.username.clone(),
            known_as: sender.known_as.clone(),
        });

        match self.transport.send_to_connections(connection_ids, frame).await {
            Ok(delivered) => {
                debug!(sender = %sender.username, delivered, "Notification dispatched");
                delivered
            }
            Err(DeliveryError::Partial { delivered, total }) => {
                warn!(sender = %sender.username, delivered, total, "Notification partially delivered");
                delivered
            }
            Err(e) => {
                warn!(sender = %sender.username, error = %e, "Notification not delivered");
                0
            }
        }
    }
}
