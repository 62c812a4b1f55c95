//! Frame router: authentication, subscriptions and event fan-out

use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::constants::{
    CHANNEL_ADMIN_ALL, CHANNEL_ALERTS_ALL, CHANNEL_SERVICE_ALL, CLOSE_POLICY_VIOLATION,
    TARGET_ALL_USERS,
};
use crate::core::connection::{Connection, Identity};
use crate::core::message_types::{
    AuthPayload, ChannelsPayload, ClientType, FrameType, InboundFrame, NotificationTargets,
    OutboundFrame, ServiceType,
};
use crate::core::rate_limiter::MessageRateLimiter;
use crate::core::registry::{Admission, ClientRegistry};
use crate::error::{RelayError, Result};

/// Authentication phase of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unauthenticated,
    Authenticated,
}

/// Per-socket routing state, owned by the socket task
pub struct Session {
    connection: Arc<Connection>,
    identity: Identity,
    phase: Phase,
}

impl Session {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            identity: Identity::anonymous(),
            phase: Phase::Unauthenticated,
        }
    }

    pub fn id(&self) -> &str {
        &self.connection.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }
}

/// What the transport should do after a frame has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close { code: u16, reason: &'static str },
}

/// Interprets inbound frames and drives the registry
pub struct MessageRouter {
    registry: Arc<ClientRegistry>,
    rate_limiter: Arc<MessageRateLimiter>,
    authenticator: Arc<Authenticator>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ClientRegistry>,
        rate_limiter: Arc<MessageRateLimiter>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            authenticator,
        }
    }

    /// Process one text frame from a client.
    ///
    /// Every failure is reported to the client as a frame; only a capacity
    /// refusal asks the transport to close the socket.
    pub async fn handle_message(&self, session: &mut Session, text: &str) -> Disposition {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unparseable frame from {}: {}", session.id(), e);
                self.send_error(session, "Invalid message format");
                return Disposition::Continue;
            }
        };

        let frame_type = FrameType::parse(&frame.frame_type);
        let exempt = frame_type.map(|t| t.is_rate_exempt()).unwrap_or(false);
        if !exempt && !self.rate_limiter.allow(session.id()).await {
            self.send_rate_limit_error(session).await;
            return Disposition::Continue;
        }

        let Some(frame_type) = frame_type else {
            info!("Unknown message type from {}: {}", session.id(), frame.frame_type);
            return Disposition::Continue;
        };

        let result = match frame_type {
            FrameType::Auth => self.handle_auth(session, &frame).await,
            FrameType::Subscribe => self.handle_subscribe(session, &frame).await,
            FrameType::Unsubscribe => self.handle_unsubscribe(session, &frame).await,
            FrameType::Ping => self.handle_ping(session),
            t if t.is_order_event() => self.handle_order_event(session, t, &frame).await,
            t if t.is_batch_event() => self.handle_batch_event(session, t, &frame).await,
            FrameType::FraudAlert => self.handle_fraud_alert(session, &frame).await,
            FrameType::ScanLogged | FrameType::InventoryLow | FrameType::InventoryUpdated => {
                self.handle_admin_feed(session, frame_type, &frame).await
            }
            FrameType::Notification => self.handle_notification(session, &frame).await,
            FrameType::Broadcast => self.handle_broadcast(session, &frame).await,
            other => {
                info!("Ignoring server-only frame {:?} from {}", other, session.id());
                Ok(Disposition::Continue)
            }
        };

        match result {
            Ok(disposition) => disposition,
            Err(e) => self.report(session, e),
        }
    }

    fn report(&self, session: &Session, error: RelayError) -> Disposition {
        match error {
            RelayError::MessageParseError(details) => {
                debug!("Malformed payload from {}: {}", session.id(), details);
                self.send_error(session, "Invalid message format");
            }
            RelayError::AuthError(reason) | RelayError::Unauthorized(reason) => {
                debug!("Rejected frame from {}: {}", session.id(), reason);
                self.send_error(session, &reason);
            }
            RelayError::CapacityExceeded(reason) => {
                self.send_error(session, &reason);
                return Disposition::Close {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "Connection limit reached",
                };
            }
            other => warn!("Failed to handle frame from {}: {}", session.id(), other),
        }
        Disposition::Continue
    }

    async fn handle_auth(&self, session: &mut Session, frame: &InboundFrame) -> Result<Disposition> {
        if session.is_authenticated() {
            return Err(RelayError::AuthError("already authenticated".to_string()));
        }

        let credentials: AuthPayload = frame.payload_as()?;
        let identity = self.authenticator.authenticate(&credentials)?;

        let admission = self
            .registry
            .admit(session.connection.clone(), identity.clone())
            .await;
        if let Admission::Denied { reason, .. } = admission {
            return Err(RelayError::CapacityExceeded(reason.to_string()));
        }

        session.identity = identity;
        session.phase = Phase::Authenticated;

        for channel in default_channels(&session.identity) {
            self.registry.subscribe(session.id(), &channel).await;
        }
        let subscriptions = self
            .registry
            .subscriptions_of(session.id())
            .await
            .unwrap_or_default();

        let identity = &session.identity;
        self.send(
            session,
            FrameType::AuthSuccess,
            json!({
                "clientId": session.id(),
                "clientType": identity.client_type,
                "userId": identity.user_id,
                "role": identity.role,
                "serviceType": identity.service_type,
                "subscriptions": subscriptions,
            }),
        );

        info!(
            "Client authenticated: {} ({:?}, {})",
            session.id(),
            identity.client_type,
            identity.label()
        );
        Ok(Disposition::Continue)
    }

    async fn handle_subscribe(&self, session: &Session, frame: &InboundFrame) -> Result<Disposition> {
        require_subscriber(session)?;
        let ChannelsPayload { channels } = frame.payload_as()?;

        let mut subscribed = Vec::with_capacity(channels.len());
        for channel in channels {
            if !may_subscribe(&session.identity, &channel) {
                info!("Subscribe denied: {} tried to subscribe to {}", session.id(), channel);
                continue;
            }
            if self.registry.subscribe(session.id(), &channel).await {
                subscribed.push(channel);
            }
        }

        let all = self
            .registry
            .subscriptions_of(session.id())
            .await
            .unwrap_or_default();
        self.send(
            session,
            FrameType::Subscribe,
            json!({ "subscribed": subscribed, "allSubscriptions": all }),
        );
        Ok(Disposition::Continue)
    }

    async fn handle_unsubscribe(&self, session: &Session, frame: &InboundFrame) -> Result<Disposition> {
        require_subscriber(session)?;
        let ChannelsPayload { channels } = frame.payload_as()?;

        let mut unsubscribed = Vec::with_capacity(channels.len());
        for channel in channels {
            if self.registry.unsubscribe(session.id(), &channel).await {
                unsubscribed.push(channel);
            }
        }

        let all = self
            .registry
            .subscriptions_of(session.id())
            .await
            .unwrap_or_default();
        self.send(
            session,
            FrameType::Unsubscribe,
            json!({ "unsubscribed": unsubscribed, "allSubscriptions": all }),
        );
        Ok(Disposition::Continue)
    }

    fn handle_ping(&self, session: &Session) -> Result<Disposition> {
        session.connection.liveness().mark_alive();
        session.connection.send_frame(&OutboundFrame::new(FrameType::Pong, None));
        Ok(Disposition::Continue)
    }

    async fn handle_order_event(
        &self,
        session: &Session,
        frame_type: FrameType,
        frame: &InboundFrame,
    ) -> Result<Disposition> {
        require_service(session)?;
        let text = relay_text(frame_type, frame)?;

        let mut delivered = 0;
        if let Some(user_id) = frame.payload_str("userId") {
            delivered += self
                .registry
                .send_to_channel(&format!("orders:{}", user_id), &text)
                .await;
        }
        delivered += self.registry.send_to_channel(CHANNEL_ADMIN_ALL, &text).await;
        // Orders originate in the user backend; only that direction is relayed
        if session.identity.service_type == Some(ServiceType::UserBe) {
            self.relay_to_counterpart(session, &text).await;
        }

        info!(
            "{:?} for order {} delivered to {} clients",
            frame_type,
            frame.payload_str("orderId").unwrap_or("-"),
            delivered
        );
        Ok(Disposition::Continue)
    }

    async fn handle_batch_event(
        &self,
        session: &Session,
        frame_type: FrameType,
        frame: &InboundFrame,
    ) -> Result<Disposition> {
        require_service(session)?;
        let text = relay_text(frame_type, frame)?;

        let delivered = self.registry.send_to_channel(CHANNEL_ADMIN_ALL, &text).await;
        if frame_type == FrameType::BatchRecalled {
            self.relay_to_counterpart(session, &text).await;
        }

        info!(
            "{:?} for batch {} delivered to {} admin clients",
            frame_type,
            frame.payload_str("batchId").unwrap_or("-"),
            delivered
        );
        Ok(Disposition::Continue)
    }

    async fn handle_fraud_alert(&self, session: &Session, frame: &InboundFrame) -> Result<Disposition> {
        require_service(session)?;
        let text = relay_text(FrameType::FraudAlert, frame)?;

        self.registry.send_to_channel(CHANNEL_ALERTS_ALL, &text).await;
        self.relay_to_counterpart(session, &text).await;

        info!(
            "Fraud alert {} ({})",
            frame.payload_str("alertType").unwrap_or("-"),
            frame.payload_str("severity").unwrap_or("-")
        );
        Ok(Disposition::Continue)
    }

    /// Scan and inventory events feed the admin dashboards only
    async fn handle_admin_feed(
        &self,
        session: &Session,
        frame_type: FrameType,
        frame: &InboundFrame,
    ) -> Result<Disposition> {
        require_service(session)?;
        let text = relay_text(frame_type, frame)?;
        let delivered = self.registry.send_to_channel(CHANNEL_ADMIN_ALL, &text).await;
        debug!("{:?} delivered to {} admin clients", frame_type, delivered);
        Ok(Disposition::Continue)
    }

    async fn handle_notification(&self, session: &Session, frame: &InboundFrame) -> Result<Disposition> {
        if !session.identity.is_service() && !session.identity.has_admin_role() {
            return Err(RelayError::Unauthorized("Unauthorized".to_string()));
        }
        let targets: NotificationTargets = frame.payload_as()?;
        let text = relay_text(FrameType::Notification, frame)?;

        let mut delivered = 0;
        if targets.target_users.iter().any(|u| u == TARGET_ALL_USERS) {
            delivered += self.registry.broadcast_all(&text, None).await;
        } else {
            for user_id in &targets.target_users {
                delivered += self.registry.send_to_user(user_id, &text).await;
            }
        }
        for role in &targets.target_roles {
            delivered += self.registry.send_to_role(role, &text).await;
        }

        info!(
            "Notification sent to {} users, {} roles ({} deliveries)",
            targets.target_users.len(),
            targets.target_roles.len(),
            delivered
        );
        Ok(Disposition::Continue)
    }

    async fn handle_broadcast(&self, session: &Session, frame: &InboundFrame) -> Result<Disposition> {
        require_service(session)?;
        let text = relay_text(FrameType::Broadcast, frame)?;
        let delivered = self.registry.broadcast_all(&text, Some(session.id())).await;
        info!("Broadcast from {} delivered to {} clients", session.id(), delivered);
        Ok(Disposition::Continue)
    }

    /// Forward a service event to the other backend, if it is connected
    async fn relay_to_counterpart(&self, session: &Session, text: &str) {
        if let Some(service_type) = session.identity.service_type {
            let target = service_type.counterpart();
            if !self.registry.send_to_service(target, text).await {
                debug!("No {} connection to relay to", target);
            }
        }
    }

    fn send(&self, session: &Session, frame_type: FrameType, payload: serde_json::Value) {
        session
            .connection
            .send_frame(&OutboundFrame::with_payload(frame_type, payload));
    }

    fn send_error(&self, session: &Session, error: &str) {
        self.send(session, FrameType::AuthError, json!({ "error": error }));
    }

    async fn send_rate_limit_error(&self, session: &Session) {
        let remaining = self.rate_limiter.remaining(session.id()).await;
        let reset_in = self.rate_limiter.reset_in(session.id()).await;
        self.send(
            session,
            FrameType::RateLimitError,
            json!({
                "error": "Rate limit exceeded. Please slow down.",
                "remaining": remaining,
                "resetInMs": reset_in.as_millis() as u64,
            }),
        );
        info!(
            "Client {} rate limited, reset in {}ms",
            session.id(),
            reset_in.as_millis()
        );
    }
}

/// Channels every newly admitted connection joins
pub fn default_channels(identity: &Identity) -> Vec<String> {
    let mut channels = Vec::new();
    if let Some(user_id) = &identity.user_id {
        channels.push(format!("user:{}", user_id));
        channels.push(format!("orders:{}", user_id));
        channels.push(format!("notifications:{}", user_id));
    }
    if let (ClientType::Service, Some(service_type)) = (identity.client_type, identity.service_type) {
        channels.push(CHANNEL_SERVICE_ALL.to_string());
        channels.push(format!("service:{}", service_type));
    }
    if identity.has_admin_role() {
        channels.push(CHANNEL_ADMIN_ALL.to_string());
        channels.push(CHANNEL_ALERTS_ALL.to_string());
    }
    channels
}

/// Users may only join scoped channels that end with their own id
pub fn may_subscribe(identity: &Identity, channel: &str) -> bool {
    if identity.client_type != ClientType::User || !channel.contains(':') {
        return true;
    }
    identity
        .user_id
        .as_deref()
        .map(|user_id| channel.ends_with(user_id))
        .unwrap_or(false)
}

fn require_subscriber(session: &Session) -> Result<()> {
    if session.identity.can_subscribe() {
        Ok(())
    } else {
        Err(RelayError::Unauthorized("authentication required".to_string()))
    }
}

fn require_service(session: &Session) -> Result<()> {
    if session.identity.is_service() {
        Ok(())
    } else {
        Err(RelayError::Unauthorized("Unauthorized".to_string()))
    }
}

/// Re-stamp an inbound event for delivery
fn relay_text(frame_type: FrameType, frame: &InboundFrame) -> Result<String> {
    OutboundFrame::new(frame_type, frame.payload.clone()).to_json()
}
