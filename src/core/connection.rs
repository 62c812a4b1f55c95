//! WebSocket connection management
//! Handles the identity, liveness and outbound side of one client socket

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;
use warp::ws::Message;

use crate::constants::ADMIN_ROLES;
use crate::core::message_types::{ClientType, OutboundFrame, ServiceType};

/// Who a connection claims to be once authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_type: ClientType,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub service_type: Option<ServiceType>,
}

impl Identity {
    /// Identity of a connection that has not authenticated yet
    pub fn anonymous() -> Self {
        Self {
            client_type: ClientType::User,
            user_id: None,
            role: None,
            service_type: None,
        }
    }

    /// User or admin identity backed by a verified token
    pub fn account(client_type: ClientType, user_id: String, role: Option<String>) -> Self {
        Self {
            client_type,
            user_id: Some(user_id),
            role,
            service_type: None,
        }
    }

    pub fn service(service_type: ServiceType) -> Self {
        Self {
            client_type: ClientType::Service,
            user_id: None,
            role: None,
            service_type: Some(service_type),
        }
    }

    pub fn is_service(&self) -> bool {
        self.client_type == ClientType::Service
    }

    /// Holds one of the administrative roles, regardless of which secret signed the token
    pub fn has_admin_role(&self) -> bool {
        self.role
            .as_deref()
            .map(|role| ADMIN_ROLES.contains(&role))
            .unwrap_or(false)
    }

    /// Accounts and services may manage subscriptions
    pub fn can_subscribe(&self) -> bool {
        self.user_id.is_some() || self.is_service()
    }

    /// Short label for log lines
    pub fn label(&self) -> String {
        match (&self.user_id, self.service_type) {
            (Some(user_id), _) => user_id.clone(),
            (None, Some(service_type)) => service_type.to_string(),
            (None, None) => "anonymous".to_string(),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Two-state liveness flag.
///
/// The heartbeat sweep is the only caller of [`Liveness::take`]; the pong
/// handler is the only caller of [`Liveness::mark_alive`].
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
    last_heartbeat_ms: AtomicI64,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Record a heartbeat answer
    pub fn mark_alive(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.alive.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether the connection answered since the last sweep
    pub fn take(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        let millis = self.last_heartbeat_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents the state of a single WebSocket connection
pub struct Connection {
    pub id: String,
    sender: mpsc::UnboundedSender<Message>,
    liveness: Liveness,
    terminate: Notify,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create a new connection with a unique ID
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn with_id(id: String, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            sender,
            liveness: Liveness::new(),
            terminate: Notify::new(),
            connected_at: Utc::now(),
        }
    }

    /// Whether the outbound half can still accept frames
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Send a text message through this connection
    pub fn send_text(&self, text: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.sender.send(Message::text(text)) {
            Ok(_) => true,
            Err(_) => {
                warn!("Failed to send message to client {}", self.id);
                false
            }
        }
    }

    /// Serialize and send a stamped frame
    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match frame.to_json() {
            Ok(text) => self.send_text(&text),
            Err(e) => {
                warn!("Failed to serialize {:?} for client {}: {}", frame.frame_type, self.id, e);
                false
            }
        }
    }

    /// Send a transport-level ping
    pub fn send_ping(&self) -> bool {
        self.sender.send(Message::ping(Vec::new())).is_ok()
    }

    /// Start the close handshake with the given status
    pub fn close(&self, code: u16, reason: &'static str) -> bool {
        self.sender.send(Message::close_with(code, reason)).is_ok()
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Ask the socket task to drop the connection without a close handshake
    pub fn terminate(&self) {
        self.terminate.notify_one();
    }

    /// Resolves once [`Connection::terminate`] has been called
    pub async fn terminated(&self) {
        self.terminate.notified().await
    }
}
