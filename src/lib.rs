//! Rusty Relay - a real-time WebSocket relay implemented in Rust
//!
//! Authenticated users, admins and backend services connect over a single
//! WebSocket endpoint; the relay tracks their subscriptions and fans out
//! backend events to the right audiences.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod security;

// Re-export main components
pub use config::RelayConfig;
pub use constants::*;
pub use error::{RelayError, Result};
