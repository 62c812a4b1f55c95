//! Relay server that coordinates sockets, the registry and the background timers

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use warp::ws::Message;

use crate::auth::Authenticator;
use crate::config::RelayConfig;
use crate::constants::{CLOSE_GOING_AWAY, SERVICE_NAME};
use crate::core::connection::Connection;
use crate::core::message_handler::{Disposition, MessageRouter, Session};
use crate::core::message_types::{FrameType, OutboundFrame};
use crate::core::rate_limiter::{MessageRateLimiter, RateLimiterStats};
use crate::core::registry::{ClientRegistry, ConnectionLimits, RegistryStats};

/// Poll step while waiting for sockets to drain during shutdown
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Body of the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub success: bool,
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: DateTime<Utc>,
    pub open_sockets: usize,
    pub stats: RegistryStats,
    pub rate_limiter: RateLimiterStats,
}

/// Integrated server state shared by every socket task
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ClientRegistry>,
    rate_limiter: Arc<MessageRateLimiter>,
    router: MessageRouter,
    sockets: RwLock<HashMap<String, Arc<Connection>>>,
    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub type SharedRelayServer = Arc<RelayServer>;

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(ClientRegistry::new(ConnectionLimits {
            max_total: config.max_total_connections,
            max_per_user: config.max_connections_per_user,
        }));
        let rate_limiter = Arc::new(MessageRateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_max_messages,
        ));
        let authenticator = Arc::new(Authenticator::from_config(&config));
        let router = MessageRouter::new(registry.clone(), rate_limiter.clone(), authenticator);

        Self {
            config,
            registry,
            rate_limiter,
            router,
            sockets: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Start the heartbeat and the rate-limiter sweep
    pub fn start_background_tasks(self: &Arc<Self>) {
        let server = self.clone();
        let every = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let terminated = server.heartbeat_sweep().await;
                if terminated > 0 {
                    info!("Heartbeat terminated {} inactive connections", terminated);
                }
            }
        });
        let sweep = self
            .rate_limiter
            .clone()
            .start_sweep_task(self.config.rate_limit_sweep_interval);

        match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.push(heartbeat);
                tasks.push(sweep);
            }
            Err(e) => {
                warn!("Task list poisoned, timers will not be stoppable: {}", e);
            }
        }
        info!(
            "Heartbeat every {}ms, rate limiter sweep every {}ms",
            every.as_millis(),
            self.config.rate_limit_sweep_interval.as_millis()
        );
    }

    /// Track a freshly upgraded socket and greet it
    pub async fn open_connection(&self, sender: mpsc::UnboundedSender<Message>) -> Session {
        let connection = Arc::new(Connection::new(sender));
        let open = {
            let mut sockets = self.sockets.write().await;
            sockets.insert(connection.id.clone(), connection.clone());
            sockets.len()
        };

        connection.send_frame(&OutboundFrame::with_payload(
            FrameType::Connected,
            json!({
                "connectionId": connection.id,
                "message": "Connected to WebSocket server. Please authenticate.",
            }),
        ));

        info!("Client connected: {} ({} open sockets)", connection.id, open);
        Session::new(connection)
    }

    pub async fn handle_text(&self, session: &mut Session, text: &str) -> Disposition {
        self.router.handle_message(session, text).await
    }

    /// Forget a connection everywhere; safe to call more than once
    pub async fn release(&self, connection_id: &str) {
        let was_open = self.sockets.write().await.remove(connection_id).is_some();
        let was_admitted = self.registry.remove(connection_id).await;
        self.rate_limiter.remove(connection_id).await;
        if was_open || was_admitted {
            debug!("Released connection {}", connection_id);
        }
    }

    /// One heartbeat pass: terminate connections that never answered the
    /// previous ping and ping the rest. Returns how many were terminated.
    pub async fn heartbeat_sweep(&self) -> usize {
        let connections: Vec<Arc<Connection>> =
            self.sockets.read().await.values().cloned().collect();

        let mut terminated = 0;
        for connection in connections {
            if connection.liveness().take() {
                connection.send_ping();
            } else {
                info!(
                    "Terminating inactive client {} (last heartbeat {})",
                    connection.id,
                    connection.liveness().last_heartbeat()
                );
                connection.terminate();
                self.release(&connection.id).await;
                terminated += 1;
            }
        }
        terminated
    }

    pub async fn open_sockets(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Stop accepting, notify and close every socket, then stop the timers.
    ///
    /// Sockets still open after the configured timeout are terminated.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down relay server");

        let connections: Vec<Arc<Connection>> =
            self.sockets.read().await.values().cloned().collect();
        let notice = OutboundFrame::with_payload(
            FrameType::ServerShutdown,
            json!({ "message": "Server is shutting down" }),
        );
        for connection in &connections {
            connection.send_frame(&notice);
            connection.close(CLOSE_GOING_AWAY, "Server shutting down");
        }
        info!("Closing {} connections", connections.len());

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while self.open_sockets().await > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;

        if drained.is_err() {
            let stragglers: Vec<Arc<Connection>> =
                self.sockets.read().await.values().cloned().collect();
            warn!(
                "Shutdown timeout reached, terminating {} connections",
                stragglers.len()
            );
            for connection in stragglers {
                connection.terminate();
                self.release(&connection.id).await;
            }
        }

        match self.tasks.lock() {
            Ok(mut tasks) => {
                for task in tasks.drain(..) {
                    task.abort();
                }
            }
            Err(e) => warn!("Task list poisoned during shutdown: {}", e),
        }
        info!("Relay server shut down");
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            success: true,
            status: if self.is_accepting() { "healthy" } else { "shutting_down" },
            service: SERVICE_NAME,
            timestamp: Utc::now(),
            open_sockets: self.open_sockets().await,
            stats: self.registry.stats().await,
            rate_limiter: self.rate_limiter.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        let mut config = RelayConfig::with_credentials(
            "server-user-signing-01",
            "server-admin-signing-02",
            "server-admin-be-key-03",
            "server-user-be-key-04",
        );
        config.heartbeat_interval = Duration::from_secs(30);
        config.shutdown_timeout = Duration::from_secs(5);
        config
    }

    #[tokio::test]
    async fn test_open_connection_sends_greeting() {
        let server = RelayServer::new(config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = server.open_connection(tx).await;

        let greeting = rx.recv().await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(greeting.to_str().unwrap()).unwrap();
        assert_eq!(frame["type"], "CONNECTED");
        assert_eq!(frame["payload"]["connectionId"], session.id());
        assert_eq!(server.open_sockets().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_terminates_silent_connection() {
        let server = RelayServer::new(config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = server.open_connection(tx).await;
        rx.recv().await.unwrap();

        // First sweep pings
        assert_eq!(server.heartbeat_sweep().await, 0);
        assert!(rx.recv().await.unwrap().is_ping());

        // No pong before the next sweep
        assert_eq!(server.heartbeat_sweep().await, 1);
        assert_eq!(server.open_sockets().await, 0);
        tokio::time::timeout(Duration::from_secs(1), session.connection().terminated())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_responsive_connection() {
        let server = RelayServer::new(config());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.open_connection(tx).await;
        for _ in 0..3 {
            assert_eq!(server.heartbeat_sweep().await, 0);
            session.connection().liveness().mark_alive();
        }
        assert_eq!(server.open_sockets().await, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let server = RelayServer::new(config());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.open_connection(tx).await;
        let id = session.id().to_string();
        server.release(&id).await;
        server.release(&id).await;
        assert_eq!(server.open_sockets().await, 0);
        assert_eq!(server.registry().client_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_notifies_and_terminates_stragglers() {
        let server = Arc::new(RelayServer::new(config()));
        server.start_background_tasks();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = server.open_connection(tx).await;
        rx.recv().await.unwrap();

        server.shutdown().await;
        assert!(!server.is_accepting());

        let notice: serde_json::Value =
            serde_json::from_str(rx.recv().await.unwrap().to_str().unwrap()).unwrap();
        assert_eq!(notice["type"], "SERVER_SHUTDOWN");
        let close = rx.recv().await.unwrap();
        assert!(close.is_close());
        assert_eq!(close.close_frame().map(|(code, _)| code), Some(1001));

        // Nobody released the socket, so the timeout path terminated it
        assert_eq!(server.open_sockets().await, 0);
        tokio::time::timeout(Duration::from_secs(1), session.connection().terminated())
            .await
            .unwrap();
        assert_eq!(server.health().await.status, "shutting_down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_early_when_drained() {
        let server = Arc::new(RelayServer::new(config()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.open_connection(tx).await;
        let id = session.id().to_string();

        let releaser = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            releaser.release(&id).await;
        });

        let started = tokio::time::Instant::now();
        server.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.open_sockets().await, 0);
    }
}
