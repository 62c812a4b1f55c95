//! Credential classification for freshly opened connections

use std::fmt;

use crate::auth::token::TokenManager;
use crate::config::RelayConfig;
use crate::core::connection::Identity;
use crate::core::message_types::{AuthPayload, ClientType, ServiceType};
use crate::error::RelayError;
use crate::security::secrets_match;

/// Why a credential was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidServiceKey,
    InvalidToken,
    NoCredentials,
}

impl AuthFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthFailure::InvalidServiceKey => "invalid service key",
            AuthFailure::InvalidToken => "invalid token",
            AuthFailure::NoCredentials => "no authentication provided",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl From<AuthFailure> for RelayError {
    fn from(failure: AuthFailure) -> Self {
        RelayError::AuthError(failure.reason().to_string())
    }
}

/// Stateless verifier for bearer tokens and service shared keys.
///
/// Service credentials take precedence over a token; a token is tried
/// against the user secret first and the admin secret second.
pub struct Authenticator {
    user_tokens: TokenManager,
    admin_tokens: TokenManager,
    admin_be_key: String,
    user_be_key: String,
}

impl Authenticator {
    pub fn new(
        user_secret: &str,
        admin_secret: &str,
        admin_be_key: impl Into<String>,
        user_be_key: impl Into<String>,
    ) -> Self {
        Self {
            user_tokens: TokenManager::new(user_secret),
            admin_tokens: TokenManager::new(admin_secret),
            admin_be_key: admin_be_key.into(),
            user_be_key: user_be_key.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            &config.user_jwt_secret,
            &config.admin_jwt_secret,
            config.admin_be_service_key.clone(),
            config.user_be_service_key.clone(),
        )
    }

    /// Classify the credentials carried by an `AUTH` frame
    pub fn authenticate(&self, credentials: &AuthPayload) -> Result<Identity, AuthFailure> {
        if let (Some(key), Some(service_name)) = (
            credentials.service_key.as_deref(),
            credentials.service_type.as_deref(),
        ) {
            return match ServiceType::parse(service_name) {
                Some(service_type) => self.verify_service_key(key, service_type),
                None => Err(AuthFailure::InvalidServiceKey),
            };
        }

        match credentials.token.as_deref() {
            Some(token) => self.verify_token(token),
            None => Err(AuthFailure::NoCredentials),
        }
    }

    fn verify_service_key(
        &self,
        key: &str,
        service_type: ServiceType,
    ) -> Result<Identity, AuthFailure> {
        let expected = match service_type {
            ServiceType::AdminBe => &self.admin_be_key,
            ServiceType::UserBe => &self.user_be_key,
        };

        if secrets_match(key, expected) {
            Ok(Identity::service(service_type))
        } else {
            Err(AuthFailure::InvalidServiceKey)
        }
    }

    fn verify_token(&self, token: &str) -> Result<Identity, AuthFailure> {
        if let Ok(claims) = self.user_tokens.get_claims(token) {
            return Ok(Identity::account(ClientType::User, claims.user_id, claims.role));
        }

        match self.admin_tokens.get_claims(token) {
            Ok(claims) => Ok(Identity::account(ClientType::Admin, claims.user_id, claims.role)),
            Err(e) => {
                log::debug!("Token rejected under both secrets: {}", e);
                Err(AuthFailure::InvalidToken)
            }
        }
    }
}
