//! Backend FHIR client facade.
//!
//! The pipeline talks to the backend exclusively through the [`FhirBackend`]
//! trait so tests can substitute stubs with call-count assertions.
//! [`FhirClient`] is the production implementation: a thin `reqwest` wrapper
//! that attaches the shared bearer token plus the caller's audit headers and
//! normalizes every reply into a [`BackendResponse`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method};
use serde_json::Value;
use thiserror::Error;

use fhirgate_core::document::resource_type;

use crate::response::{BackendResponse, DEFAULT_RETAINED_HEADERS};
use crate::token::TokenCache;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token acquisition failed: {0}")]
    Token(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// The operations the gateway core needs from the backend FHIR service.
#[async_trait]
pub trait FhirBackend: Send + Sync {
    /// `GET {base}/{resource_type}?{query}`
    async fn search(
        &self,
        resource_type: &str,
        query: &str,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError>;

    /// `GET {base}/{path}` with an optional query string; `path` is a
    /// resource path such as `Patient/123` or `Patient/123/_history/2`.
    async fn read(
        &self,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError>;

    /// Write a resource or Bundle. `resource_type` is the type segment of
    /// the inbound path, absent for bare Bundle posts.
    async fn save(
        &self,
        resource_type: Option<&str>,
        body: &Value,
        method: Method,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError>;

    /// `DELETE {base}/{path}`
    async fn delete(&self, path: &str, headers: &HeaderMap)
    -> Result<BackendResponse, ClientError>;
}

/// Production backend client.
pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCache>,
    retained_headers: Vec<String>,
}

impl FhirClient {
    pub fn new(base_url: &str, tokens: Arc<TokenCache>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            retained_headers: DEFAULT_RETAINED_HEADERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Overrides the response-header allow-list.
    pub fn with_retained_headers(mut self, retained: Vec<String>) -> Self {
        self.retained_headers = retained;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: Option<&str>,
        body: Option<&Value>,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError> {
        let token = self.tokens.bearer().await?;
        let full_url = match query {
            Some(q) if !q.is_empty() => {
                let sep = if q.starts_with('?') { "" } else { "?" };
                format!("{url}{sep}{q}")
            }
            _ => url.to_string(),
        };
        let mut req = self
            .http
            .request(method, &full_url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .headers(headers.clone());
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let resp_headers = resp.headers().clone();
        let text = resp.text().await.unwrap_or_default();
        Ok(BackendResponse::from_parts(
            status,
            &text,
            &resp_headers,
            &self.retained_headers,
        ))
    }

    /// Validates a write body against the inbound path and returns the
    /// backend path to post it to. Bundle posts address the service base;
    /// typed writes must match the path's resource type and, for anything
    /// but POST, carry an id.
    fn save_path(
        resource_type_segment: Option<&str>,
        body: &Value,
        method: &Method,
    ) -> Result<String, ClientError> {
        let body_type = resource_type(body)
            .ok_or_else(|| ClientError::InvalidRequest("resourceType not found in content".into()))?;

        match resource_type_segment {
            // Bundles are processed at the service base, whether the inbound
            // path named them or not.
            None | Some("") | Some("Bundle") => {
                if body_type != "Bundle" {
                    return Err(ClientError::InvalidRequest(
                        "only Bundle content may be posted to the service base".into(),
                    ));
                }
                if *method != Method::POST {
                    return Err(ClientError::InvalidRequest(
                        "verb must be POST for Bundle processing".into(),
                    ));
                }
                Ok(String::new())
            }
            Some(expected) => {
                if body_type != expected {
                    return Err(ClientError::InvalidRequest(format!(
                        "request type {expected} does not match resourceType {body_type} in content"
                    )));
                }
                if *method == Method::POST {
                    Ok(expected.to_string())
                } else {
                    let id = body.get("id").and_then(Value::as_str).ok_or_else(|| {
                        ClientError::InvalidRequest(
                            "resource id is required for modification verbs".into(),
                        )
                    })?;
                    Ok(format!("{expected}/{id}"))
                }
            }
        }
    }
}

#[async_trait]
impl FhirBackend for FhirClient {
    async fn search(
        &self,
        resource_type: &str,
        query: &str,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError> {
        self.execute(Method::GET, &self.url(resource_type), Some(query), None, headers)
            .await
    }

    async fn read(
        &self,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError> {
        self.execute(Method::GET, &self.url(path), query, None, headers)
            .await
    }

    async fn save(
        &self,
        resource_type: Option<&str>,
        body: &Value,
        method: Method,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError> {
        if !matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            return Err(ClientError::InvalidRequest(format!(
                "{method} is not supported for save"
            )));
        }
        let path = Self::save_path(resource_type, body, &method)?;
        self.execute(method, &self.url(&path), None, Some(body), headers)
            .await
    }

    async fn delete(
        &self,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<BackendResponse, ClientError> {
        self.execute(Method::DELETE, &self.url(path), None, None, headers)
            .await
    }
}
