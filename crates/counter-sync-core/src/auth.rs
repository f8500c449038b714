use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Authenticated user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

/// Credential material for remote access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

impl Session {
    /// Sessions are treated as expired five minutes early; a session without
    /// expiry information is always considered expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now >= exp - Duration::minutes(5),
            None => true,
        }
    }
}

/// What the sync engine needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub endpoint: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Session provider backed by a remote auth service.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The current session, refreshed first if it has expired.
    async fn get_session(&self) -> Result<Option<Session>, AuthError>;

    /// Create a new anonymous user and session.
    async fn sign_in_anonymously(&self) -> Result<Session, AuthError>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Session, AuthError>;

    /// Revoke the current session and forget it locally.
    async fn sign_out(&self) -> Result<(), AuthError>;
}
