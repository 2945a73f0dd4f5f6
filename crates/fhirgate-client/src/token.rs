//! Process-wide bearer token cache.
//!
//! The backend credential is expensive to acquire and safe to share once
//! valid, so one `TokenCache` lives for the process and is consulted by
//! every request. Refresh follows a double-checked discipline: a read-lock
//! liveness check keeps the common case contention-free, and a write-lock
//! recheck ensures only one task refreshes when the token actually expired.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::client::ClientError;

/// Refresh this far before the reported expiry so a token never lapses
/// mid-call.
const REFRESH_MARGIN: Duration = Duration::seconds(30);

/// A bearer token with its expiry instant.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// True when the token is still usable at `now`, margin included.
    pub fn is_fresh_at(&self, now: OffsetDateTime) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(OffsetDateTime::now_utc())
    }
}

/// Where fresh tokens come from. Production uses OAuth2 client credentials;
/// tests substitute a fake.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, ClientError>;
}

/// OAuth2 client-credentials grant against a token endpoint.
pub struct OAuthClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    /// Audience/resource identifier of the backend FHIR service.
    resource: String,
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    300
}

impl OAuthClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            resource: resource.into(),
        }
    }
}

#[async_trait]
impl TokenSource for OAuthClientCredentials {
    async fn fetch(&self) -> Result<AccessToken, ClientError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("resource", self.resource.as_str()),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Token(format!(
                "token endpoint returned HTTP {status}: {body}"
            )));
        }
        let parsed: TokenEndpointResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Token(format!("invalid token response: {e}")))?;
        Ok(AccessToken::new(
            parsed.access_token,
            OffsetDateTime::now_utc() + Duration::seconds(parsed.expires_in),
        ))
    }
}

/// Fixed token, for local development and tests.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn fetch(&self) -> Result<AccessToken, ClientError> {
        Ok(AccessToken::new(
            self.0.clone(),
            OffsetDateTime::now_utc() + Duration::days(3650),
        ))
    }
}

/// Shared cache of the current backend bearer token.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    current: RwLock<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            current: RwLock::new(None),
        }
    }

    /// Returns a fresh bearer token, refreshing through the source when the
    /// cached one is missing or expired.
    pub async fn bearer(&self) -> Result<String, ClientError> {
        // Outer liveness check under the read lock.
        if let Some(token) = self.current.read().await.as_ref()
            && token.is_fresh()
        {
            return Ok(token.token.clone());
        }
        // Inner recheck under the write lock: another task may have
        // refreshed while we waited.
        let mut guard = self.current.write().await;
        if let Some(token) = guard.as_ref()
            && token.is_fresh()
        {
            return Ok(token.token.clone());
        }
        tracing::info!("obtaining new bearer token for backend access");
        let token = self.source.fetch().await?;
        let value = token.token.clone();
        *guard = Some(token);
        Ok(value)
    }
}
