//! # duet-core
//!
//! Presence tracking, conversation groups and the connection gateway for the
//! Duet direct-messaging engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Presence** - Which users have at least one open connection
//! - **Group** - The per-conversation set of viewing connections
//! - **Gateway** - Connect, disconnect and send-message orchestration
//! - **Hub** - In-process [`Transport`] with per-connection outbound queues
//! - **Store** - Persistence traits, with in-memory implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Gateway   │────▶│   Stores    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │         │
//!                       ▼         ▼
//!              ┌─────────────┐ ┌─────────────┐
//!              │  Presence   │ │  Transport  │
//!              └─────────────┘ └─────────────┘
//! ```

pub mod gateway;
pub mod group;
pub mod hub;
pub mod identity;
pub mod memory;
pub mod message;
pub mod notify;
pub mod presence;
pub mod store;
pub mod transport;

pub use gateway::{
    CreateMessage, Disconnected, Gateway, GatewayConfig, GatewayError, Joined, Services,
};
pub use group::{group_name, Connection, Group};
pub use hub::{Hub, HubConfig, HubError, HubStats, Outbound};
pub use identity::{ConnectionContext, IdentityResolver, TokenIdentity, PEER_PARAM};
pub use memory::{MemoryGroupStore, MemoryMessageStore, MemoryUserStore};
pub use message::{Message, MessageId};
pub use notify::NotificationDispatcher;
pub use presence::PresenceRegistry;
pub use store::{GroupStore, MessageStore, StoreError, User, UserStore};
pub use transport::{DeliveryError, Transport};
