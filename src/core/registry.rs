//! In-memory directory of admitted connections
//!
//! All indexes live behind one lock: admit, remove, subscribe and
//! unsubscribe take it exclusively, fan-out and lookups take it shared.
//! A connection id is present in a secondary index only while its primary
//! entry exists, and in a channel's subscriber set exactly when the channel
//! is in that entry's own subscription set.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::connection::{Connection, Identity};
use crate::core::message_types::{ClientType, ServiceType};

/// Registry view of one admitted connection
#[derive(Clone)]
pub struct ClientHandle {
    pub connection: Arc<Connection>,
    pub identity: Identity,
    pub subscriptions: HashSet<String>,
}

impl ClientHandle {
    pub fn id(&self) -> &str {
        &self.connection.id
    }

    /// Deliver text if the socket is still writable
    pub fn send_text(&self, text: &str) -> bool {
        self.connection.is_open() && self.connection.send_text(text)
    }
}

/// Outcome of a capacity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied {
        reason: &'static str,
        current: usize,
        max: usize,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Admission::Allowed => None,
            Admission::Denied { reason, .. } => Some(reason),
        }
    }
}

/// Connection caps enforced at admission time
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_total: usize,
    pub max_per_user: usize,
}

/// Aggregate counts for health and diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_clients: usize,
    pub unique_users: usize,
    pub active_channels: usize,
    pub services: Vec<ServiceType>,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<String, ClientHandle>,
    users: HashMap<String, HashSet<String>>,
    services: HashMap<ServiceType, String>,
    channels: HashMap<String, HashSet<String>>,
}

impl RegistryState {
    fn with_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a ClientHandle> + 'a {
        self.clients
            .values()
            .filter(move |client| client.identity.role.as_deref() == Some(role))
    }

    fn check(&self, user_id: Option<&str>, limits: &ConnectionLimits) -> Admission {
        if self.clients.len() >= limits.max_total {
            return Admission::Denied {
                reason: "Server at maximum capacity",
                current: self.clients.len(),
                max: limits.max_total,
            };
        }

        if let Some(user_id) = user_id {
            let current = self.users.get(user_id).map(HashSet::len).unwrap_or(0);
            if current >= limits.max_per_user {
                return Admission::Denied {
                    reason: "Maximum connections per user reached",
                    current,
                    max: limits.max_per_user,
                };
            }
        }

        Admission::Allowed
    }

    fn unsubscribe(&mut self, client_id: &str, channel: &str) -> bool {
        let Some(client) = self.clients.get_mut(client_id) else {
            return false;
        };
        let removed = client.subscriptions.remove(channel);

        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(client_id);
            if subscribers.is_empty() {
                self.channels.remove(channel);
            }
        }

        removed
    }

    fn handles<'a, I>(&self, ids: I) -> Vec<ClientHandle>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter()
            .filter_map(|id| self.clients.get(id))
            .cloned()
            .collect()
    }
}

/// Connection directory with user, service and channel indexes
pub struct ClientRegistry {
    state: RwLock<RegistryState>,
    limits: ConnectionLimits,
}

impl ClientRegistry {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            limits,
        }
    }

    /// Check both caps against the current snapshot without registering anything
    pub async fn can_admit(&self, user_id: Option<&str>) -> Admission {
        let state = self.state.read().await;
        state.check(user_id, &self.limits)
    }

    /// Register an authenticated connection if capacity allows.
    ///
    /// The capacity check and the insert happen under the same write lock,
    /// so two concurrent admits can never both take the last slot.
    pub async fn admit(&self, connection: Arc<Connection>, identity: Identity) -> Admission {
        let mut state = self.state.write().await;

        let admission = state.check(identity.user_id.as_deref(), &self.limits);
        if let Admission::Denied { reason, current, max } = &admission {
            log::info!(
                "Connection denied for {}: {} ({}/{})",
                connection.id, reason, current, max
            );
            return admission;
        }

        let id = connection.id.clone();
        if let Some(user_id) = &identity.user_id {
            state
                .users
                .entry(user_id.clone())
                .or_default()
                .insert(id.clone());
        }
        if let (ClientType::Service, Some(service_type)) =
            (identity.client_type, identity.service_type)
        {
            // Single slot per service type: a reconnecting backend takes over the index
            if let Some(previous) = state.services.insert(service_type, id.clone()) {
                if previous != id {
                    log::warn!(
                        "Service {} re-registered: {} supersedes {}",
                        service_type, id, previous
                    );
                }
            }
        }

        log::info!("Client added: {} ({:?}, {})", id, identity.client_type, identity.label());
        state.clients.insert(
            id,
            ClientHandle {
                connection,
                identity,
                subscriptions: HashSet::new(),
            },
        );
        log::debug!(
            "Registry stats: {} clients, {} users, {} channels",
            state.clients.len(),
            state.users.len(),
            state.channels.len()
        );

        Admission::Allowed
    }

    /// Drop a connection from every index. Unknown ids are ignored.
    pub async fn remove(&self, client_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.get(client_id) else {
            return false;
        };
        let identity = client.identity.clone();
        let channels: Vec<String> = client.subscriptions.iter().cloned().collect();

        if let Some(user_id) = &identity.user_id {
            if let Some(ids) = state.users.get_mut(user_id) {
                ids.remove(client_id);
                if ids.is_empty() {
                    state.users.remove(user_id);
                }
            }
        }

        if let Some(service_type) = identity.service_type {
            if state.services.get(&service_type).map(String::as_str) == Some(client_id) {
                state.services.remove(&service_type);
            }
        }

        for channel in &channels {
            state.unsubscribe(client_id, channel);
        }

        state.clients.remove(client_id);
        log::info!("Client removed: {}", client_id);
        log::debug!(
            "Registry stats: {} clients, {} users, {} channels",
            state.clients.len(),
            state.users.len(),
            state.channels.len()
        );
        true
    }

    /// Add a channel to a connection's subscriptions; false if the connection is unknown
    pub async fn subscribe(&self, client_id: &str, channel: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.get_mut(client_id) else {
            return false;
        };
        client.subscriptions.insert(channel.to_string());
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(client_id.to_string());
        log::debug!("{} subscribed to {}", client_id, channel);
        true
    }

    /// Remove a channel from a connection's subscriptions
    pub async fn unsubscribe(&self, client_id: &str, channel: &str) -> bool {
        let mut state = self.state.write().await;
        state.unsubscribe(client_id, channel)
    }

    /// Sorted subscription set of one connection
    pub async fn subscriptions_of(&self, client_id: &str) -> Option<Vec<String>> {
        let state = self.state.read().await;
        state.clients.get(client_id).map(|client| {
            let mut channels: Vec<String> = client.subscriptions.iter().cloned().collect();
            channels.sort();
            channels
        })
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.state.read().await.clients.contains_key(client_id)
    }

    pub async fn subscribers_of(&self, channel: &str) -> Vec<ClientHandle> {
        let state = self.state.read().await;
        match state.channels.get(channel) {
            Some(ids) => state.handles(ids),
            None => Vec::new(),
        }
    }

    pub async fn connections_of(&self, user_id: &str) -> Vec<ClientHandle> {
        let state = self.state.read().await;
        match state.users.get(user_id) {
            Some(ids) => state.handles(ids),
            None => Vec::new(),
        }
    }

    pub async fn service_connection(&self, service_type: ServiceType) -> Option<ClientHandle> {
        let state = self.state.read().await;
        state
            .services
            .get(&service_type)
            .and_then(|id| state.clients.get(id))
            .cloned()
    }

    pub async fn by_client_type(&self, client_type: ClientType) -> Vec<ClientHandle> {
        let state = self.state.read().await;
        state
            .clients
            .values()
            .filter(|client| client.identity.client_type == client_type)
            .cloned()
            .collect()
    }

    pub async fn by_role(&self, role: &str) -> Vec<ClientHandle> {
        let state = self.state.read().await;
        state.with_role(role).cloned().collect()
    }

    /// Send to every admitted connection except `exclude_id`
    pub async fn broadcast_all(&self, text: &str, exclude_id: Option<&str>) -> usize {
        let state = self.state.read().await;
        state
            .clients
            .values()
            .filter(|client| Some(client.id()) != exclude_id)
            .filter(|client| client.send_text(text))
            .count()
    }

    pub async fn send_to_channel(&self, channel: &str, text: &str) -> usize {
        let state = self.state.read().await;
        let Some(ids) = state.channels.get(channel) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| state.clients.get(id))
            .filter(|client| client.send_text(text))
            .count()
    }

    /// Send to every device of one user
    pub async fn send_to_user(&self, user_id: &str, text: &str) -> usize {
        let state = self.state.read().await;
        let Some(ids) = state.users.get(user_id) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| state.clients.get(id))
            .filter(|client| client.send_text(text))
            .count()
    }

    pub async fn send_to_service(&self, service_type: ServiceType, text: &str) -> bool {
        let state = self.state.read().await;
        state
            .services
            .get(&service_type)
            .and_then(|id| state.clients.get(id))
            .map(|client| client.send_text(text))
            .unwrap_or(false)
    }

    pub async fn send_to_role(&self, role: &str, text: &str) -> usize {
        let state = self.state.read().await;
        state.with_role(role).filter(|client| client.send_text(text)).count()
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        let mut services: Vec<ServiceType> = state.services.keys().copied().collect();
        services.sort_by_key(|service| service.as_str());
        RegistryStats {
            total_clients: state.clients.len(),
            unique_users: state.users.len(),
            active_channels: state.channels.len(),
            services,
        }
    }

    /// Check the index invariants, returning a description of the first violation
    pub async fn verify_consistency(&self) -> Result<(), String> {
        let state = self.state.read().await;

        for (channel, ids) in &state.channels {
            if ids.is_empty() {
                return Err(format!("channel {} has an empty subscriber set", channel));
            }
            for id in ids {
                match state.clients.get(id) {
                    Some(client) if client.subscriptions.contains(channel) => {}
                    Some(_) => return Err(format!("{} indexed under {} but not subscribed", id, channel)),
                    None => return Err(format!("dangling id {} in channel {}", id, channel)),
                }
            }
        }
        for (id, client) in &state.clients {
            for channel in &client.subscriptions {
                let indexed = state
                    .channels
                    .get(channel)
                    .map(|ids| ids.contains(id))
                    .unwrap_or(false);
                if !indexed {
                    return Err(format!("{} subscribed to {} but not indexed", id, channel));
                }
            }
        }
        for (user_id, ids) in &state.users {
            if ids.is_empty() || ids.len() > self.limits.max_per_user {
                return Err(format!("user {} index has {} entries", user_id, ids.len()));
            }
            if let Some(id) = ids.iter().find(|id| !state.clients.contains_key(*id)) {
                return Err(format!("dangling id {} in user {}", id, user_id));
            }
        }
        for (service_type, id) in &state.services {
            if !state.clients.contains_key(id) {
                return Err(format!("dangling id {} in service {}", id, service_type));
            }
        }
        if state.clients.len() > self.limits.max_total {
            return Err(format!("{} clients exceed the global cap", state.clients.len()));
        }

        Ok(())
    }
}
