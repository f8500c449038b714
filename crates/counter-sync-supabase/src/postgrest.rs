//! PostgREST client for row-level writes.
//!
//! Requests are authorized with the current user's access token so that
//! row-level security applies; without a session the anon key is used.

use std::sync::Arc;

use async_trait::async_trait;
use counter_sync_core::{AuthProvider, RemoteError, RemoteStore};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

/// PostgREST error body.
#[derive(Deserialize)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

pub struct PostgrestClient {
    http: Client,
    base_url: String,
    anon_key: String,
    auth: Arc<dyn AuthProvider>,
}

impl PostgrestClient {
    pub fn new(
        http: Client,
        supabase_url: &str,
        anon_key: &str,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            http,
            base_url: format!("{}/rest/v1", supabase_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
            auth,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    async fn bearer_token(&self) -> Result<String, RemoteError> {
        match self.auth.get_session().await {
            Ok(Some(session)) => Ok(session.access_token),
            Ok(None) => Ok(self.anon_key.clone()),
            Err(e) => Err(RemoteError::transport(format!(
                "Could not resolve session: {}",
                e
            ))),
        }
    }

    async fn send(&self, request: RequestBuilder, prefer: &str) -> Result<(), RemoteError> {
        let token = self.bearer_token().await?;
        let response = request
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .header("Prefer", prefer)
            .send()
            .await
            .map_err(|e| RemoteError::transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(parse_error(status.as_u16(), &body))
    }
}

/// Turn a failed response into a `RemoteError`, keeping the Postgres code.
fn parse_error(status: u16, body: &str) -> RemoteError {
    match serde_json::from_str::<PostgrestErrorBody>(body) {
        Ok(err) => {
            let mut message = err
                .message
                .unwrap_or_else(|| format!("HTTP {}", status));
            if let Some(details) = err.details.filter(|d| !d.is_empty()) {
                message = format!("{} ({})", message, details);
            }
            if let Some(hint) = err.hint.filter(|h| !h.is_empty()) {
                message = format!("{}. Hint: {}", message, hint);
            }
            RemoteError {
                code: err.code,
                message,
            }
        }
        Err(_) => RemoteError::transport(format!("HTTP {}: {}", status, body)),
    }
}

#[async_trait]
impl RemoteStore for PostgrestClient {
    #[instrument(skip(self, row), level = "debug")]
    async fn upsert(&self, table: &str, row: &Map<String, Value>) -> Result<(), RemoteError> {
        // Merge on the primary key: replays of the same PUT are harmless.
        let request = self.http.post(self.table_url(table)).json(row);
        self.send(request, "resolution=merge-duplicates,return=minimal")
            .await?;
        debug!("Upserted row into {}", table);
        Ok(())
    }

    #[instrument(skip(self, patch), level = "debug")]
    async fn update(
        &self,
        table: &str,
        patch: &Map<String, Value>,
        id: &str,
    ) -> Result<(), RemoteError> {
        let request = self
            .http
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .json(patch);
        self.send(request, "return=minimal").await?;
        debug!("Updated {}/{}", table, id);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let request = self
            .http
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        self.send(request, "return=minimal").await?;
        debug!("Deleted {}/{}", table, id);
        Ok(())
    }
}
