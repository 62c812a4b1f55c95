//! Rate limiting module to prevent abuse
//!
//! Fixed-window message counter keyed by connection id. A window opens on
//! the first frame from a client and resets on the first frame after it
//! has fully elapsed; counts never carry over.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Message count within the current window of one client
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start: Instant,
}

/// Snapshot for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub tracked_clients: usize,
    pub window_ms: u64,
    pub max_messages: u32,
}

/// Rate limiter for messages per connection
pub struct MessageRateLimiter {
    entries: RwLock<HashMap<String, RateLimitEntry>>,
    window: Duration,
    max_messages: u32,
}

impl MessageRateLimiter {
    pub fn new(window: Duration, max_messages: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
            max_messages,
        }
    }

    /// Count one frame against the client's budget, returning whether it may proceed
    pub async fn allow(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(client_id.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                window_start: now,
            });

        if entry.count == 0 || now.duration_since(entry.window_start) > self.window {
            entry.count = 1;
            entry.window_start = now;
            return true;
        }

        if entry.count < self.max_messages {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Frames left in the client's current window
    pub async fn remaining(&self, client_id: &str) -> u32 {
        let entries = self.entries.read().await;
        match entries.get(client_id) {
            Some(entry) if entry.window_start.elapsed() <= self.window => {
                self.max_messages.saturating_sub(entry.count)
            }
            _ => self.max_messages,
        }
    }

    /// Time until the client's window resets (zero if it has none)
    pub async fn reset_in(&self, client_id: &str) -> Duration {
        let entries = self.entries.read().await;
        entries
            .get(client_id)
            .map(|entry| self.window.saturating_sub(entry.window_start.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Forget a client entirely
    pub async fn remove(&self, client_id: &str) {
        self.entries.write().await.remove(client_id);
    }

    /// Drop every window that has fully elapsed, returning how many were removed
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.window_start) <= self.window);
        before - entries.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_clients: self.tracked_clients().await,
            window_ms: self.window.as_millis() as u64,
            max_messages: self.max_messages,
        }
    }

    /// Start the periodic sweep; abort the returned handle to stop it
    pub fn start_sweep_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = self.sweep().await;
                if removed > 0 {
                    log::debug!("Rate limiter sweep removed {} stale windows", removed);
                }
            }
        })
    }
}
