//! Relay configuration module
//! Handles capacity, rate limit, heartbeat and credential parameters

use crate::constants::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS_PER_USER,
    DEFAULT_MAX_TOTAL_CONNECTIONS, DEFAULT_PORT, DEFAULT_RATE_LIMIT_MAX_MESSAGES,
    DEFAULT_RATE_LIMIT_SWEEP_MS, DEFAULT_RATE_LIMIT_WINDOW_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS,
};
use crate::error::{RelayError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const MIN_SECRET_LENGTH: usize = 16;

/// Relay configuration parameters
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Hard cap on admitted connections across all users and services
    pub max_total_connections: usize,
    /// Cap on simultaneously admitted connections sharing one user id
    pub max_connections_per_user: usize,
    /// Length of the fixed rate limit window
    pub rate_limit_window: Duration,
    /// Messages allowed per client within one window
    pub rate_limit_max_messages: u32,
    /// How often stale rate limit windows are swept
    pub rate_limit_sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on waiting for sockets to close during shutdown
    pub shutdown_timeout: Duration,
    /// Signing secret for consumer tokens
    pub user_jwt_secret: String,
    /// Signing secret for admin tokens (must differ from the user secret)
    pub admin_jwt_secret: String,
    pub admin_be_service_key: String,
    pub user_be_service_key: String,
}

impl RelayConfig {
    /// Build a configuration with default limits around the given credentials.
    pub fn with_credentials(
        user_jwt_secret: impl Into<String>,
        admin_jwt_secret: impl Into<String>,
        admin_be_service_key: impl Into<String>,
        user_be_service_key: impl Into<String>,
    ) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_connections_per_user: DEFAULT_MAX_CONNECTIONS_PER_USER,
            rate_limit_window: Duration::from_millis(DEFAULT_RATE_LIMIT_WINDOW_MS),
            rate_limit_max_messages: DEFAULT_RATE_LIMIT_MAX_MESSAGES,
            rate_limit_sweep_interval: Duration::from_millis(DEFAULT_RATE_LIMIT_SWEEP_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            user_jwt_secret: user_jwt_secret.into(),
            admin_jwt_secret: admin_jwt_secret.into(),
            admin_be_service_key: admin_be_service_key.into(),
            user_be_service_key: user_be_service_key.into(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Every key is tried with the `RELAY_` prefix first and then under the
    /// plain name shared with the backend services.
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("RELAY_{}", key)).or_else(|| lookup(key))
        };

        let host = get("HOST")
            .or_else(|| lookup("WS_HOST"))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or(get("PORT").or_else(|| lookup("WS_PORT")), DEFAULT_PORT, "PORT")?;

        let max_total_connections = parse_or(
            get("MAX_TOTAL_CONNECTIONS"),
            DEFAULT_MAX_TOTAL_CONNECTIONS,
            "MAX_TOTAL_CONNECTIONS",
        )?;
        let max_connections_per_user = parse_or(
            get("MAX_CONNECTIONS_PER_USER"),
            DEFAULT_MAX_CONNECTIONS_PER_USER,
            "MAX_CONNECTIONS_PER_USER",
        )?;
        let window_ms = parse_or(
            get("RATE_LIMIT_WINDOW_MS"),
            DEFAULT_RATE_LIMIT_WINDOW_MS,
            "RATE_LIMIT_WINDOW_MS",
        )?;
        let rate_limit_max_messages = parse_or(
            get("RATE_LIMIT_MAX_MESSAGES"),
            DEFAULT_RATE_LIMIT_MAX_MESSAGES,
            "RATE_LIMIT_MAX_MESSAGES",
        )?;
        let sweep_ms = parse_or(
            lookup("RELAY_RATE_LIMIT_SWEEP_MS"),
            DEFAULT_RATE_LIMIT_SWEEP_MS,
            "RATE_LIMIT_SWEEP_MS",
        )?;
        let heartbeat_ms = parse_or(
            get("HEARTBEAT_INTERVAL_MS"),
            DEFAULT_HEARTBEAT_INTERVAL_MS,
            "HEARTBEAT_INTERVAL_MS",
        )?;
        let shutdown_ms = parse_or(
            lookup("RELAY_SHUTDOWN_TIMEOUT_MS"),
            DEFAULT_SHUTDOWN_TIMEOUT_MS,
            "SHUTDOWN_TIMEOUT_MS",
        )?;

        let user_jwt_secret = required(get("JWT_SECRET_USER"), "JWT_SECRET_USER")?;
        let admin_jwt_secret = required(get("JWT_SECRET_ADMIN"), "JWT_SECRET_ADMIN")?;
        let admin_be_service_key = required(get("ADMIN_BE_SERVICE_KEY"), "ADMIN_BE_SERVICE_KEY")?;
        let user_be_service_key = required(get("USER_BE_SERVICE_KEY"), "USER_BE_SERVICE_KEY")?;

        let config = Self {
            host,
            port,
            max_total_connections,
            max_connections_per_user,
            rate_limit_window: Duration::from_millis(window_ms),
            rate_limit_max_messages,
            rate_limit_sweep_interval: Duration::from_millis(sweep_ms),
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            shutdown_timeout: Duration::from_millis(shutdown_ms),
            user_jwt_secret,
            admin_jwt_secret,
            admin_be_service_key,
            user_be_service_key,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check limits and credentials for obviously unsafe values
    pub fn validate(&self) -> Result<()> {
        if self.max_total_connections == 0 || self.max_connections_per_user == 0 {
            return Err(RelayError::ConfigError(
                "connection limits must be greater than zero".to_string(),
            ));
        }
        if self.rate_limit_max_messages == 0 || self.rate_limit_window.is_zero() {
            return Err(RelayError::ConfigError(
                "rate limit window and message count must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.rate_limit_sweep_interval.is_zero() {
            return Err(RelayError::ConfigError(
                "timer intervals must be greater than zero".to_string(),
            ));
        }

        validate_secret(&self.user_jwt_secret, "JWT_SECRET_USER")?;
        validate_secret(&self.admin_jwt_secret, "JWT_SECRET_ADMIN")?;
        validate_secret(&self.admin_be_service_key, "ADMIN_BE_SERVICE_KEY")?;
        validate_secret(&self.user_be_service_key, "USER_BE_SERVICE_KEY")?;

        // A shared secret would let a user token pass as an admin token
        if self.user_jwt_secret == self.admin_jwt_secret {
            return Err(RelayError::ConfigError(
                "JWT_SECRET_USER and JWT_SECRET_ADMIN must be different".to_string(),
            ));
        }
        if self.admin_be_service_key == self.user_be_service_key {
            return Err(RelayError::ConfigError(
                "ADMIN_BE_SERVICE_KEY and USER_BE_SERVICE_KEY must be different".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T, name: &str) -> Result<T> {
    match value {
        Some(raw) => raw.trim().parse().map_err(|_| {
            RelayError::ConfigError(format!("{} has an invalid value: {}", name, raw))
        }),
        None => Ok(default),
    }
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        RelayError::ConfigError(format!(
            "{} environment variable is required. Generate one with: openssl rand -base64 32",
            name
        ))
    })
}

/// Validate that a secret meets minimum requirements
fn validate_secret(secret: &str, name: &str) -> Result<()> {
    if secret.len() < MIN_SECRET_LENGTH {
        return Err(RelayError::ConfigError(format!(
            "{} must be at least {} characters long",
            name, MIN_SECRET_LENGTH
        )));
    }

    // Placeholder values shipped in sample .env files
    let insecure_patterns = [
        "user-secret",
        "admin-secret",
        "admin-service-key",
        "user-service-key",
        "change-this",
        "changeme",
        "your-secret",
    ];
    let lowered = secret.to_lowercase();
    for pattern in &insecure_patterns {
        if lowered.contains(pattern) {
            return Err(RelayError::ConfigError(format!(
                "{} contains insecure placeholder '{}'",
                name, pattern
            )));
        }
    }

    Ok(())
}
