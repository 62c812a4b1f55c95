//! Frame and identity types for the relay wire protocol

use chrono::{DateTime, Utc};
use serde::de::IntoDeserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

/// Connection classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    User,
    Admin,
    Service,
}

/// Known backend services that may connect with a shared key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    AdminBe,
    UserBe,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::AdminBe => "admin-be",
            ServiceType::UserBe => "user-be",
        }
    }

    /// Map a wire name to a known service
    pub fn parse(name: &str) -> Option<ServiceType> {
        let deserializer: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
            name.into_deserializer();
        ServiceType::deserialize(deserializer).ok()
    }

    /// The other backend, used when relaying events between services
    pub fn counterpart(&self) -> ServiceType {
        match self {
            ServiceType::AdminBe => ServiceType::UserBe,
            ServiceType::UserBe => ServiceType::AdminBe,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every frame type that crosses the wire in either direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    // Handshake and control
    Auth,
    AuthSuccess,
    AuthError,
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Connected,
    ServerShutdown,
    RateLimitError,

    // Order events
    OrderCreated,
    OrderStatusChanged,
    OrderPaymentUpdate,

    // Batch events
    BatchCreated,
    BatchStatusChanged,
    BatchRecalled,

    // Scan and inventory events
    ScanLogged,
    FraudAlert,
    InventoryLow,
    InventoryUpdated,

    Notification,
    Broadcast,
}

impl FrameType {
    /// Parse a wire name, returning None for types this relay does not know
    pub fn parse(name: &str) -> Option<FrameType> {
        let deserializer: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
            name.into_deserializer();
        FrameType::deserialize(deserializer).ok()
    }

    pub fn is_order_event(&self) -> bool {
        matches!(
            self,
            FrameType::OrderCreated | FrameType::OrderStatusChanged | FrameType::OrderPaymentUpdate
        )
    }

    pub fn is_batch_event(&self) -> bool {
        matches!(
            self,
            FrameType::BatchCreated | FrameType::BatchStatusChanged | FrameType::BatchRecalled
        )
    }

    /// Frames that bypass the per-client message budget
    pub fn is_rate_exempt(&self) -> bool {
        matches!(self, FrameType::Auth | FrameType::Ping)
    }
}

/// Raw inbound frame: `{ type, payload? }`
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Deserialize the payload into a typed shape, treating a missing payload as `{}`
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let value = self
            .payload
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(serde_json::from_value(value)?)
    }

    /// Look up a string field of the payload
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.as_ref()?.get(field)?.as_str()
    }
}

/// `AUTH` payload.
///
/// `clientType` and `serviceType` stay raw strings: the former is only
/// informational and an unknown service name is a credential failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: Option<String>,
    pub service_key: Option<String>,
    pub client_type: Option<String>,
    pub service_type: Option<String>,
}

/// `SUBSCRIBE` / `UNSUBSCRIBE` payload
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsPayload {
    pub channels: Vec<String>,
}

/// Addressing fields of a `NOTIFICATION` payload; the rest passes through untouched
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTargets {
    #[serde(default)]
    pub target_users: Vec<String>,
    #[serde(default)]
    pub target_roles: Vec<String>,
}

/// Outbound frame, always stamped with a fresh message id and timestamp
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

impl OutboundFrame {
    pub fn new(frame_type: FrameType, payload: Option<Value>) -> Self {
        Self {
            frame_type,
            payload,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_payload(frame_type: FrameType, payload: Value) -> Self {
        Self::new(frame_type, Some(payload))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
