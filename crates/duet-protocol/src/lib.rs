//! # duet-protocol
//!
//! Wire protocol definitions for the Duet realtime messaging layer.
//!
//! This crate defines the frames exchanged between clients and the server,
//! the event payloads they carry, and the codecs used to put them on the wire.
//!
//! ## Frame Types
//!
//! - `send_message` - Client request to message another user
//! - `ack` / `error` - Request outcomes
//! - `ping` / `pong` / `connected` - Connection control
//! - `GroupUpdated`, `ReceivedMessageThread`, `NewMessage`,
//!   `NewMessageReceived`, `UserIsOnline`, `UserIsOffline`, `OnlineUsers` -
//!   Server-pushed events
//!
//! ## Example
//!
//! ```rust
//! use duet_protocol::{Frame, codec};
//!
//! let frame = Frame::send_message(1, "bob", "Hello, Bob!");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod payload;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{Frame, FrameType, PROTOCOL_VERSION};
pub use payload::{ConnectionDto, GroupDto, MessageDto, SenderSummary};
