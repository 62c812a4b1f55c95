// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3003;
pub const WS_PATH: &str = "ws";
pub const SERVICE_NAME: &str = "Rusty Relay WebSocket Server";

// Capacity and rate limit defaults
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 1000;
pub const DEFAULT_MAX_CONNECTIONS_PER_USER: usize = 5;
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_RATE_LIMIT_MAX_MESSAGES: u32 = 100;
pub const DEFAULT_RATE_LIMIT_SWEEP_MS: u64 = 60_000;

// Lifecycle timers
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

// WebSocket close codes
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

// Well-known channels
pub const CHANNEL_ADMIN_ALL: &str = "admin:all";
pub const CHANNEL_ALERTS_ALL: &str = "alerts:all";
pub const CHANNEL_SERVICE_ALL: &str = "service:all";

/// Notification target that addresses every connection
pub const TARGET_ALL_USERS: &str = "all";

/// Roles that receive the admin channel set
pub const ADMIN_ROLES: [&str; 2] = ["ADMIN", "SUPERADMIN"];
