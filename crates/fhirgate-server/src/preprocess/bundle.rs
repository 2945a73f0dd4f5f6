//! Transaction bundle resolution.
//!
//! A FHIR "transaction" bundle expects the server to execute all entries
//! atomically and resolve `urn:uuid:` cross-references itself. Backends
//! without transactional guarantees cannot honor that, so this stage rewrites
//! the submission into a "batch" of conditional PUTs with deterministic ids.
//! Each entry's client-supplied UUID becomes the resource id and `request.url`
//! becomes `Type?_id=<id>`, which is idempotent under retried or out-of-order
//! delivery. Cross-entry references are fixed up by textual substitution over
//! the serialized body.

use async_trait::async_trait;
use http::Method;
use serde_json::Value;
use tracing::{debug, warn};

use fhirgate_client::FhirBackend;
use fhirgate_core::document;
use fhirgate_core::reference::{self, URN_UUID_PREFIX};

use crate::pipeline::{PreProcessor, ProcessResult, RequestContext};

pub struct TransformBundle;

#[async_trait]
impl PreProcessor for TransformBundle {
    fn name(&self) -> &'static str {
        "transform_bundle"
    }

    async fn process(
        &self,
        body: &str,
        ctx: &RequestContext,
        backend: &dyn FhirBackend,
    ) -> ProcessResult {
        if ctx.method == Method::GET || ctx.method == Method::DELETE || body.is_empty() {
            return ProcessResult::pass();
        }
        let Ok(parsed) = serde_json::from_str::<Value>(body) else {
            // Malformed JSON falls through to the backend's own validation.
            return ProcessResult::pass();
        };
        if !document::is_bundle_of_type(&parsed, "transaction") {
            return ProcessResult::pass();
        }

        let resolved = resolve_conditional_creates(body, &parsed, ctx, backend).await;
        match convert_to_batch(&resolved) {
            Some(rewritten) => ProcessResult::rewrite(rewritten),
            None => ProcessResult::pass(),
        }
    }
}

/// Phase 1: for every entry carrying `request.ifNoneExist`, ask the backend
/// whether a matching resource already exists. On a hit, every textual
/// occurrence of that entry's `urn:uuid:` token is redirected to the existing
/// resource's id, so the batch conversion localizes the entry onto it. A
/// failed search means "no match" and leaves the entry alone.
///
/// Searches run sequentially because later entries may reference identifiers
/// settled by earlier resolutions in the same body.
async fn resolve_conditional_creates(
    raw: &str,
    parsed: &Value,
    ctx: &RequestContext,
    backend: &dyn FhirBackend,
) -> String {
    let mut body = raw.to_string();
    for entry in document::bundle_entries(parsed).into_iter().flatten() {
        let Some(if_none_exist) = document::get_str(entry, &["request", "ifNoneExist"]) else {
            continue;
        };
        let (Some(resource_type), Some(full_url)) = (
            document::get_str(entry, &["request", "url"]),
            document::get_str(entry, &["fullUrl"]),
        ) else {
            continue;
        };
        match backend.search(resource_type, if_none_exist, &ctx.headers).await {
            Ok(resp) if resp.is_success() => {
                let existing = resp.body.as_ref().and_then(first_entry_identity);
                if let Some((_, id)) = existing {
                    debug!(full_url, id, "conditional create matched existing resource");
                    body = body.replace(full_url, &reference::urn_uuid(&id));
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status, "conditional create search missed");
            }
            Err(e) => {
                warn!(error = %e, "conditional create search failed, treating as no match");
            }
        }
    }
    body
}

fn first_entry_identity(bundle: &Value) -> Option<(String, String)> {
    let entries = document::bundle_entries(bundle)?;
    let resource = entries.first()?.get("resource")?;
    let rt = document::resource_type(resource)?;
    let id = document::get_str(resource, &["id"])?;
    Some((rt.to_string(), id.to_string()))
}

/// Phase 2: re-parse the (possibly rewritten) body and turn the transaction
/// into a batch of conditional updates. Returns `None` when the body no
/// longer parses, which leaves the original submission untouched.
fn convert_to_batch(raw: &str) -> Option<String> {
    let mut doc: Value = serde_json::from_str(raw).ok()?;
    doc["type"] = Value::String("batch".to_string());

    let mut localized: Vec<(String, String)> = Vec::new();
    if let Some(entries) = doc.get_mut("entry").and_then(Value::as_array_mut) {
        for entry in entries {
            let Some(uuid) = document::get_str(entry, &["fullUrl"])
                .and_then(reference::uuid_of_urn)
                .map(str::to_owned)
            else {
                continue;
            };
            let Some(resource) = entry.get_mut("resource") else {
                continue;
            };
            let Some(rt) = document::resource_type(resource).map(str::to_owned) else {
                continue;
            };
            resource["id"] = Value::String(uuid.clone());
            if let Some(request) = entry.get_mut("request") {
                request["method"] = Value::String("PUT".to_string());
                request["url"] = Value::String(format!("{rt}?_id={uuid}"));
            }
            localized.push((uuid, rt));
        }
    }

    let mut text = doc.to_string();
    for (uuid, rt) in &localized {
        text = text.replace(
            &format!("{URN_UUID_PREFIX}{uuid}"),
            &format!("{rt}/{uuid}"),
        );
    }
    Some(text)
}
