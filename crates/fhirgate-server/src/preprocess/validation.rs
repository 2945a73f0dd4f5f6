//! Profile validation against an external validation service.
//!
//! Writes carrying an `ms-fp-profile` query parameter are posted to the
//! configured validation endpoint before they reach the backend. The
//! validator answers with an OperationOutcome; any issues bounce the
//! submission back to the client as a 400.

use async_trait::async_trait;
use http::{Method, StatusCode};
use serde_json::Value;
use tracing::warn;

use fhirgate_client::{BackendResponse, FhirBackend};
use fhirgate_core::outcome::operation_outcome;

use crate::config::ValidationConfig;
use crate::pipeline::{PreProcessor, ProcessResult, RequestContext};

pub const PROFILE_PARAM: &str = "ms-fp-profile";

pub struct ProfileValidation {
    http: reqwest::Client,
    config: ValidationConfig,
}

impl ProfileValidation {
    pub fn new(http: reqwest::Client, config: ValidationConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl PreProcessor for ProfileValidation {
    fn name(&self) -> &'static str {
        "profile_validation"
    }

    async fn process(
        &self,
        body: &str,
        ctx: &RequestContext,
        _backend: &dyn FhirBackend,
    ) -> ProcessResult {
        if body.is_empty() || ctx.method == Method::GET || ctx.method == Method::DELETE {
            return ProcessResult::pass();
        }
        // A bare ms-fp-profile still shows up as one empty value and
        // requests schema-only validation.
        let profiles = ctx.query_values(PROFILE_PARAM);
        if profiles.is_empty() {
            return ProcessResult::pass();
        }
        let Some(url) = self.config.url.as_deref() else {
            warn!("validation url not configured, skipping profile validation");
            return ProcessResult::pass();
        };

        // An empty ms-fp-profile value requests schema-only validation.
        let query: Vec<(&str, &str)> = profiles
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| ("profile", p.as_str()))
            .collect();
        let outcome = match self
            .http
            .post(url)
            .query(&query)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                match resp.json::<Value>().await {
                    Ok(v) if status.is_success() => v,
                    Ok(v) => {
                        return ProcessResult::respond(BackendResponse::new(status, Some(v)));
                    }
                    Err(e) => {
                        return ProcessResult::respond(BackendResponse::new(
                            StatusCode::BAD_GATEWAY,
                            Some(operation_outcome("exception", &e.to_string())),
                        ));
                    }
                }
            }
            Err(e) => {
                return ProcessResult::respond(BackendResponse::new(
                    StatusCode::BAD_GATEWAY,
                    Some(operation_outcome("exception", &e.to_string())),
                ));
            }
        };

        let has_issues = outcome
            .get("issue")
            .and_then(Value::as_array)
            .is_some_and(|issues| !issues.is_empty());
        if has_issues {
            return ProcessResult::respond(BackendResponse::new(
                StatusCode::BAD_REQUEST,
                Some(outcome),
            ));
        }
        ProcessResult::pass()
    }
}
