//! # Duet Server
//!
//! WebSocket front end for the Duet direct-messaging engine. The binary in
//! `main.rs` is a thin wrapper; the router is exposed here so it can be
//! served from tests.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
