//! Core functionality for the relay server

pub mod connection;
pub mod message_handler;
pub mod message_types;
pub mod rate_limiter;
pub mod registry;
pub mod server;

// Re-export main components for convenience
pub use connection::{Connection, Identity, Liveness};
pub use message_handler::{Disposition, MessageRouter, Session};
pub use message_types::{ClientType, FrameType, InboundFrame, OutboundFrame, ServiceType};
pub use rate_limiter::MessageRateLimiter;
pub use registry::{Admission, ClientRegistry, ConnectionLimits};
pub use server::{RelayServer, SharedRelayServer};
