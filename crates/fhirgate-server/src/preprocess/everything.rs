//! Patient-level `$everything` aggregation.
//!
//! Serves `GET Patient/{id}/$everything` without backend support for the
//! operation: one bounded query per configured resource type is fanned out
//! concurrently and the results are joined into a single non-pageable
//! searchset. A failed per-type query only costs that type's entries.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use fhirgate_client::{BackendResponse, FhirBackend};
use fhirgate_core::document;
use fhirgate_core::outcome::operation_outcome;

use crate::config::EverythingConfig;
use crate::pipeline::{PreProcessor, ProcessResult, RequestContext};

pub struct PatientEverything {
    backend: Arc<dyn FhirBackend>,
    config: EverythingConfig,
}

impl PatientEverything {
    pub fn new(backend: Arc<dyn FhirBackend>, config: EverythingConfig) -> Self {
        Self { backend, config }
    }

    fn triggers(ctx: &RequestContext) -> bool {
        ctx.method == Method::GET
            && ctx.resource_type.as_deref() == Some("Patient")
            && ctx.id.is_some()
            && ctx.hist.as_deref() == Some("$everything")
    }
}

#[async_trait]
impl PreProcessor for PatientEverything {
    fn name(&self) -> &'static str {
        "patient_everything"
    }

    async fn process(
        &self,
        _body: &str,
        ctx: &RequestContext,
        _backend: &dyn FhirBackend,
    ) -> ProcessResult {
        if !Self::triggers(ctx) {
            return ProcessResult::pass();
        }
        let Some(id) = ctx.id.clone() else {
            return ProcessResult::pass();
        };

        // The patient itself anchors the aggregation; without it there is
        // nothing to assemble.
        let initial = match self
            .backend
            .search("Patient", &format!("_id={id}"), &ctx.headers)
            .await
        {
            Ok(resp) => resp,
            Err(e) => return ProcessResult::halt(format!("patient lookup failed: {e}")),
        };
        let Some(mut bundle) = initial
            .body
            .clone()
            .filter(|b| document::is_bundle_of_type(b, "searchset"))
        else {
            return ProcessResult::respond(initial);
        };
        let mut entries: Vec<Value> = document::bundle_entries(&bundle)
            .cloned()
            .unwrap_or_default();
        if entries.is_empty() {
            return ProcessResult::respond(BackendResponse::new(
                StatusCode::NOT_FOUND,
                Some(operation_outcome(
                    "not-found",
                    &format!("Patient {id} not found"),
                )),
            ));
        }

        let mut tasks = JoinSet::new();
        for entry in &self.config.resources {
            let Some((resource_type, template)) = entry.split_once(':') else {
                continue;
            };
            let resource_type = resource_type.to_string();
            let query = format!(
                "{}&_count={}",
                template.replace("{id}", &id),
                self.config.page_size
            );
            let backend = Arc::clone(&self.backend);
            let headers = ctx.headers.clone();
            let patient = id.clone();
            tasks.spawn(async move {
                debug!(resource_type, patient, "loading resources for $everything");
                match backend.search(&resource_type, &query, &headers).await {
                    Ok(resp) => {
                        let entries = resp
                            .body
                            .as_ref()
                            .filter(|b| document::is_bundle_of_type(b, "searchset"))
                            .and_then(document::bundle_entries)
                            .cloned()
                            .unwrap_or_default();
                        entries
                    }
                    Err(e) => {
                        warn!(resource_type, patient, error = %e, "$everything sub-query failed");
                        Vec::new()
                    }
                }
            });
        }
        // Barrier join; a failed slot contributes zero entries.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(batch) => entries.extend(batch),
                Err(e) => warn!(error = %e, "$everything task panicked"),
            }
        }

        debug!(total = entries.len(), patient = %id, "assembled $everything bundle");
        bundle["entry"] = Value::Array(entries);
        // Explicitly non-pageable.
        bundle["link"] = Value::Array(Vec::new());
        let mut response = initial;
        response.status = StatusCode::OK;
        response.body = Some(bundle);
        ProcessResult::respond(response)
    }
}
