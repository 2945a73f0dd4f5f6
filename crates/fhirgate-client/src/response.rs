//! Normalized backend response.
//!
//! Every backend call collapses to the same shape: a status code, an
//! optional JSON body, and the small allow-list of response headers the
//! proxy is willing to echo back to its caller.

use http::{HeaderMap, StatusCode};
use serde_json::Value;

/// Response headers retained from the backend unless overridden in config.
pub const DEFAULT_RETAINED_HEADERS: &[&str] =
    &["Date", "Last-Modified", "ETag", "Location", "Content-Location"];

/// The uniform result of a backend call.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    /// Parsed JSON body; `None` for empty or non-JSON content.
    pub body: Option<Value>,
    /// Retained subset of the backend's response headers.
    pub headers: HeaderMap,
}

impl BackendResponse {
    pub fn new(status: StatusCode, body: Option<Value>) -> Self {
        Self {
            status,
            body,
            headers: HeaderMap::new(),
        }
    }

    /// Builds a response from raw backend parts, keeping only the headers
    /// named in `retain` (case-insensitive).
    pub fn from_parts(
        status: StatusCode,
        body_text: &str,
        headers: &HeaderMap,
        retain: &[String],
    ) -> Self {
        let mut kept = HeaderMap::new();
        for name in retain {
            if let Ok(header) = name.parse::<http::HeaderName>()
                && let Some(value) = headers.get(&header)
            {
                kept.insert(header, value.clone());
            }
        }
        let body = if body_text.trim().is_empty() {
            None
        } else {
            serde_json::from_str(body_text).ok()
        };
        Self {
            status,
            body,
            headers: kept,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Serialized body, or an empty object when no body is present. Callers
    /// at the transport boundary handle 204 separately.
    pub fn body_string(&self) -> String {
        match &self.body {
            Some(v) => v.to_string(),
            None => "{}".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn retain_defaults() -> Vec<String> {
        DEFAULT_RETAINED_HEADERS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn from_parts_filters_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("etag", "W/\"1\"".parse().unwrap());
        headers.insert("x-internal-secret", "nope".parse().unwrap());
        headers.insert("location", "http://fs/Patient/1".parse().unwrap());

        let resp =
            BackendResponse::from_parts(StatusCode::OK, "{\"resourceType\":\"Patient\"}", &headers, &retain_defaults());
        assert_eq!(resp.headers.len(), 2);
        assert!(resp.headers.contains_key("etag"));
        assert!(resp.headers.contains_key("location"));
        assert!(!resp.headers.contains_key("x-internal-secret"));
    }

    #[test]
    fn empty_and_invalid_bodies_become_none() {
        let headers = HeaderMap::new();
        let retain = retain_defaults();
        let empty = BackendResponse::from_parts(StatusCode::NO_CONTENT, "", &headers, &retain);
        assert!(empty.body.is_none());
        assert_eq!(empty.body_string(), "{}");

        let garbage = BackendResponse::from_parts(StatusCode::OK, "not json", &headers, &retain);
        assert!(garbage.body.is_none());
    }

    #[test]
    fn body_string_round_trips() {
        let resp = BackendResponse::new(StatusCode::OK, Some(json!({"resourceType": "Patient"})));
        assert_eq!(resp.body_string(), "{\"resourceType\":\"Patient\"}");
        assert!(resp.is_success());
    }
}
