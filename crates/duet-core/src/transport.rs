//! Transport abstraction used by the gateway.
//!
//! The gateway never writes to sockets directly; it addresses connections by
//! id and groups by name through this trait, so it stays transport-agnostic.
//! Every send is non-blocking and at-most-once.

use async_trait::async_trait;
use duet_protocol::Frame;
use thiserror::Error;

/// Delivery errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No open connection with this id.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The connection's outbound queue is full.
    #[error("Outbound queue full for connection {0}")]
    QueueFull(String),

    /// The connection is closing and no longer accepts frames.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Some recipients of a fan-out did not get the frame.
    #[error("Delivered to {delivered} of {total} connections")]
    Partial { delivered: usize, total: usize },
}

/// Outbound side of the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Add a connection to a transport-level group.
    async fn join_group(&self, connection_id: &str, group: &str) -> Result<(), DeliveryError>;

    /// Remove a connection from a transport-level group. Unknown pairs are ignored.
    async fn leave_group(&self, connection_id: &str, group: &str);

    /// Send a frame to every connection in a group. Returns the delivered count.
    async fn send_to_group(&self, group: &str, frame: Frame) -> Result<usize, DeliveryError>;

    /// Send a frame to each listed connection. Returns the delivered count.
    async fn send_to_connections(
        &self,
        connection_ids: &[String],
        frame: Frame,
    ) -> Result<usize, DeliveryError>;

    /// Send a frame to one connection (the caller).
    async fn send_to_connection(
        &self,
        connection_id: &str,
        frame: Frame,
    ) -> Result<(), DeliveryError>;

    /// Send a frame to every open connection except `except`.
    async fn send_to_all(&self, frame: Frame, except: Option<&str>) -> usize;
}
