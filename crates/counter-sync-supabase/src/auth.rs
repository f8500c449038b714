//! GoTrue (Supabase Auth) client.
//!
//! Holds the current session in memory, refreshes it with its refresh token
//! once it expires, and optionally persists it to a JSON file so a restarted
//! client keeps the same anonymous user.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use counter_sync_core::{AuthError, AuthProvider, Session, User};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Token grant response from `/signup` and `/token`.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: UserResponse,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    is_anonymous: bool,
}

/// GoTrue reports errors under several field names depending on version.
#[derive(Deserialize, Default)]
struct ErrorBody {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> Option<String> {
        self.msg
            .or(self.message)
            .or(self.error_description)
            .or(self.error)
    }
}

impl From<TokenResponse> for Session {
    fn from(resp: TokenResponse) -> Self {
        let expires_at = match (resp.expires_at, resp.expires_in) {
            (Some(at), _) => Utc.timestamp_opt(at, 0).single(),
            (None, Some(secs)) => Some(Utc::now() + chrono::Duration::seconds(secs)),
            (None, None) => None,
        };

        Session {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at,
            user: User {
                id: resp.user.id,
                email: resp.user.email.filter(|e| !e.is_empty()),
                is_anonymous: resp.user.is_anonymous,
            },
        }
    }
}

/// Supabase Auth client for one project.
pub struct GoTrueClient {
    http: Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<Session>>,
    session_file: Option<PathBuf>,
}

impl GoTrueClient {
    pub fn new(http: Client, supabase_url: &str, anon_key: &str) -> Self {
        Self {
            http,
            base_url: format!("{}/auth/v1", supabase_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
            session: RwLock::new(None),
            session_file: None,
        }
    }

    /// Persist sessions to `path`, loading the one stored there if any.
    ///
    /// An unreadable file is ignored: the client starts signed out.
    pub fn with_session_file(mut self, path: PathBuf) -> Self {
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => {
                    debug!("Loaded stored session for user {}", session.user.id);
                    self.session = RwLock::new(Some(session));
                }
                Err(e) => warn!("Ignoring invalid session file {}: {}", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not read session file {}: {}", path.display(), e),
        }
        self.session_file = Some(path);
        self
    }

    /// POST to a token-issuing endpoint and decode the session.
    async fn token_request(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Session, AuthError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(ErrorBody::into_message)
                .unwrap_or(text);
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::Decode(e.to_string()))?;
        Ok(token.into())
    }

    async fn store(&self, session: Session) -> Result<(), AuthError> {
        if let Some(path) = &self.session_file {
            let bytes = serde_json::to_vec_pretty(&session)
                .map_err(|e| AuthError::Storage(e.to_string()))?;
            tokio::fs::write(path, bytes)
                .await
                .map_err(|e| AuthError::Storage(e.to_string()))?;
        }
        *self.session.write().await = Some(session);
        Ok(())
    }

    /// Drop the session from memory, then from disk. Never fails: a stale
    /// file is logged and left behind.
    async fn forget(&self) -> Option<Session> {
        let previous = self.session.write().await.take();
        if let Some(path) = &self.session_file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove session file {}: {}", path.display(), e),
            }
        }
        previous
    }

    #[instrument(skip(self, refresh_token), level = "debug")]
    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let session = self
            .token_request(
                "/token?grant_type=refresh_token",
                json!({ "refresh_token": refresh_token }),
            )
            .await?;
        info!(
            "Refreshed session for user {}, expires at {:?}",
            session.user.id, session.expires_at
        );
        self.store(session.clone()).await?;
        Ok(session)
    }
}

#[async_trait]
impl AuthProvider for GoTrueClient {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let current = self.session.read().await.clone();
        match current {
            Some(session) if session.is_expired() => {
                debug!("Session for user {} expired, refreshing", session.user.id);
                self.refresh(&session.refresh_token).await.map(Some)
            }
            other => Ok(other),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn sign_in_anonymously(&self) -> Result<Session, AuthError> {
        let session = self.token_request("/signup", json!({ "data": {} })).await?;
        info!("Signed in anonymously as {}", session.user.id);
        self.store(session.clone()).await?;
        Ok(session)
    }

    #[instrument(skip(self, password), level = "debug")]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let session = self
            .token_request(
                "/token?grant_type=password",
                json!({ "email": email, "password": password }),
            )
            .await?;
        info!("Signed in as {}", session.user.id);
        self.store(session.clone()).await?;
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        // Forget the session locally even if revocation fails.
        let current = self.forget().await;

        let Some(session) = current else {
            return Ok(());
        };

        let response = self
            .http
            .post(format!("{}/logout", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        // An already revoked or unknown session is as good as signed out.
        if status.is_success() || matches!(status.as_u16(), 401 | 403 | 404) {
            info!("Signed out user {}", session.user.id);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(AuthError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }
}
