//! Participant-scoped response filtering.
//!
//! Principals outside the admin and global roles only see resources tied to
//! patients they participate in. Search bundles are filtered entry by entry;
//! a direct read of a non-visible resource is denied outright.

use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use tracing::debug;

use fhirgate_client::{BackendResponse, FhirBackend};
use fhirgate_core::document;
use fhirgate_core::outcome::operation_outcome;

use crate::access::{AccessCache, ParticipantAccess};
use crate::config::AccessConfig;
use crate::pipeline::{PostProcessor, ProcessResult, RequestContext};

pub struct ParticipantFilter {
    access: AccessConfig,
}

impl ParticipantFilter {
    pub fn new(access: AccessConfig) -> Self {
        Self { access }
    }
}

#[async_trait]
impl PostProcessor for ParticipantFilter {
    fn name(&self) -> &'static str {
        "participant_filter"
    }

    async fn process(
        &self,
        mut response: BackendResponse,
        ctx: &RequestContext,
        backend: &dyn FhirBackend,
    ) -> ProcessResult {
        if ctx.principal.is_admin(&self.access)
            || ctx.principal.is_in_any_role(&self.access.global_roles)
        {
            return ProcessResult::forward(response);
        }
        let Some(mut body) = response.body.take() else {
            return ProcessResult::forward(response);
        };
        let resource_type = document::resource_type(&body).unwrap_or_default().to_string();
        if resource_type == "OperationOutcome" {
            response.body = Some(body);
            return ProcessResult::forward(response);
        }

        let resolver = ParticipantAccess::new(backend, &ctx.headers);
        let known = resolver.known_identities(&ctx.principal, &self.access).await;
        let mut cache = AccessCache::new();

        if resource_type == "Bundle" {
            if let Some(entries) = body.get_mut("entry").and_then(Value::as_array_mut) {
                let mut kept = Vec::with_capacity(entries.len());
                let before = entries.len();
                for entry in entries.drain(..) {
                    let visible = match entry.get("resource") {
                        Some(resource) => resolver.is_visible(resource, &known, &mut cache).await,
                        None => true,
                    };
                    if visible {
                        kept.push(entry);
                    }
                }
                debug!(
                    kept = kept.len(),
                    removed = before - kept.len(),
                    "filtered bundle entries for participant"
                );
                *entries = kept;
            }
            response.body = Some(body);
            return ProcessResult::forward(response);
        }

        if !resolver.is_visible(&body, &known, &mut cache).await {
            return ProcessResult::respond(BackendResponse::new(
                StatusCode::FORBIDDEN,
                Some(operation_outcome(
                    "forbidden",
                    &format!("Not authorized to access resource: {}", ctx.target_path()),
                )),
            ));
        }
        response.body = Some(body);
        ProcessResult::forward(response)
    }
}
