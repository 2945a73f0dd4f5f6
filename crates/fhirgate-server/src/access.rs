//! Participant access resolution.
//!
//! Decides whether a clinical resource is visible to the calling principal
//! by walking the Patient, Encounter and Practitioner reference graph. A
//! resource with no resolvable patient or encounter reference is not
//! patient-scoped and stays visible; a reference that cannot be fetched is
//! treated as not visible.

use std::collections::HashMap;

use http::HeaderMap;
use serde_json::Value;
use tracing::{debug, warn};

use fhirgate_client::FhirBackend;
use fhirgate_core::document;
use fhirgate_core::reference::ResourceRef;

use crate::config::AccessConfig;
use crate::principal::Principal;

/// Visibility decisions keyed by `Type/id` identity, memoized for the
/// lifetime of one inbound request. Never shared across requests so a stale
/// authorization cannot leak between users.
#[derive(Debug, Default)]
pub struct AccessCache {
    decisions: HashMap<String, bool>,
}

impl AccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> Option<bool> {
        self.decisions.get(identity).copied()
    }

    pub fn insert(&mut self, identity: &str, visible: bool) {
        self.decisions.insert(identity.to_string(), visible);
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

/// Graph walker over the backend, scoped to one request's headers.
pub struct ParticipantAccess<'a> {
    backend: &'a dyn FhirBackend,
    headers: &'a HeaderMap,
}

impl<'a> ParticipantAccess<'a> {
    pub fn new(backend: &'a dyn FhirBackend, headers: &'a HeaderMap) -> Self {
        Self { backend, headers }
    }

    /// `Type/id` identities linked to the principal.
    ///
    /// Each of the principal's roles that names a linkable resource type
    /// (`Patient`, `Practitioner`, ...) triggers one identifier search of
    /// the form `identifier=<tenant>|<name>`; every hit contributes an
    /// identity. A failed search contributes nothing.
    pub async fn known_identities(
        &self,
        principal: &Principal,
        access: &AccessConfig,
    ) -> Vec<String> {
        let linkable = access.identity_roles();
        let mut identities = Vec::new();
        for role in &principal.roles {
            if !linkable.iter().any(|r| r == role) {
                continue;
            }
            let query = format!("identifier={}|{}", principal.tenant, principal.name);
            match self.backend.search(role, &query, self.headers).await {
                Ok(resp) => {
                    let Some(body) = &resp.body else { continue };
                    for entry in document::bundle_entries(body).into_iter().flatten() {
                        let Some(resource) = entry.get("resource") else {
                            continue;
                        };
                        if let (Some(rt), Some(id)) = (
                            document::resource_type(resource),
                            document::get_str(resource, &["id"]),
                        ) {
                            identities.push(format!("{rt}/{id}"));
                        }
                    }
                }
                Err(e) => {
                    warn!(role, error = %e, "linked identity search failed");
                }
            }
        }
        debug!(count = identities.len(), "resolved linked identities");
        identities
    }

    /// Whether `resource` is visible to a principal holding `known`
    /// identities. Decisions are memoized in `cache` under the patient and
    /// encounter identities involved.
    pub async fn is_visible(
        &self,
        resource: &Value,
        known: &[String],
        cache: &mut AccessCache,
    ) -> bool {
        let rt = document::resource_type(resource).unwrap_or_default();

        let mut patient: Option<Value> = None;
        let mut patient_id: Option<String> = None;
        let mut encounter_id: Option<String> = None;
        match rt {
            "Patient" => {
                patient_id = document::get_str(resource, &["id"]).map(|id| format!("Patient/{id}"));
                patient = Some(resource.clone());
            }
            "Encounter" => {
                encounter_id =
                    document::get_str(resource, &["id"]).map(|id| format!("Encounter/{id}"));
                patient_id =
                    document::get_str(resource, &["subject", "reference"]).map(str::to_owned);
            }
            _ => {
                patient_id =
                    document::get_str(resource, &["subject", "reference"]).map(str::to_owned);
                encounter_id =
                    document::get_str(resource, &["encounter", "reference"]).map(str::to_owned);
            }
        }

        // Not tied to a patient, nothing to filter.
        if patient_id.is_none() && encounter_id.is_none() {
            return true;
        }

        if let Some(id) = &patient_id
            && let Some(decision) = cache.get(id)
        {
            return decision;
        }
        if let Some(id) = &encounter_id
            && let Some(decision) = cache.get(id)
        {
            return decision;
        }

        if patient.is_none() {
            if let Some(pid) = &patient_id {
                match self.fetch_typed(pid, "Patient").await {
                    Some(doc) => patient = Some(doc),
                    None => {
                        cache.insert(pid, false);
                        return false;
                    }
                }
            } else if let Some(eid) = encounter_id.clone() {
                // Resolve the patient indirectly through the encounter.
                let Some(enc) = self.fetch_typed(&eid, "Encounter").await else {
                    cache.insert(&eid, false);
                    return false;
                };
                let Some(pid) =
                    document::get_str(&enc, &["subject", "reference"]).map(str::to_owned)
                else {
                    cache.insert(&eid, false);
                    return false;
                };
                match self.fetch_typed(&pid, "Patient").await {
                    Some(doc) => {
                        patient = Some(doc);
                        patient_id = Some(pid);
                    }
                    None => {
                        cache.insert(&pid, false);
                        return false;
                    }
                }
            }
        }
        let Some(patient) = patient else {
            return true;
        };

        for identity in known {
            let Some(parsed) = ResourceRef::parse(identity) else {
                continue;
            };
            if parsed.is_type("Patient") {
                if Some(identity.as_str()) == patient_id.as_deref() {
                    return decide(cache, &patient_id, &encounter_id, true);
                }
            } else if self.participant_matches(&parsed, &patient).await {
                return decide(cache, &patient_id, &encounter_id, true);
            }
        }
        decide(cache, &patient_id, &encounter_id, false)
    }

    /// A participant identity grants visibility when it is one of the
    /// patient's general practitioners, or when the backend knows an
    /// Encounter where it attended this patient.
    async fn participant_matches(&self, identity: &ResourceRef, patient: &Value) -> bool {
        let reference = identity.to_string();
        if let Some(gps) = document::get_array(patient, &["generalPractitioner"])
            && gps
                .iter()
                .any(|gp| document::get_str(gp, &["reference"]) == Some(reference.as_str()))
        {
            return true;
        }
        let Some(patient_id) = document::get_str(patient, &["id"]) else {
            return false;
        };
        let query = format!("patient={patient_id}&participant={}", identity.id);
        match self.backend.search("Encounter", &query, self.headers).await {
            Ok(resp) => resp
                .body
                .as_ref()
                .and_then(document::bundle_entries)
                .is_some_and(|entries| !entries.is_empty()),
            Err(e) => {
                warn!(identity = %reference, error = %e, "encounter participation search failed");
                false
            }
        }
    }

    async fn fetch_typed(&self, reference: &str, expected: &str) -> Option<Value> {
        match self.backend.read(reference, None, self.headers).await {
            Ok(resp) => resp
                .body
                .filter(|body| document::resource_type(body) == Some(expected)),
            Err(e) => {
                warn!(reference, error = %e, "reference fetch failed");
                None
            }
        }
    }
}

fn decide(
    cache: &mut AccessCache,
    patient_id: &Option<String>,
    encounter_id: &Option<String>,
    visible: bool,
) -> bool {
    if let Some(id) = patient_id {
        cache.insert(id, visible);
    }
    if let Some(id) = encounter_id {
        cache.insert(id, visible);
    }
    visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fhirgate_client::{BackendResponse, ClientError};
    use http::{Method, StatusCode};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend stub with canned read/search answers and call counting.
    #[derive(Default)]
    struct GraphBackend {
        reads: Mutex<HashMap<String, Value>>,
        searches: Mutex<HashMap<String, Value>>,
        calls: AtomicUsize,
    }

    impl GraphBackend {
        fn with_read(self, path: &str, doc: Value) -> Self {
            self.reads.lock().unwrap().insert(path.into(), doc);
            self
        }

        fn with_search(self, key: &str, doc: Value) -> Self {
            self.searches.lock().unwrap().insert(key.into(), doc);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FhirBackend for GraphBackend {
        async fn search(
            &self,
            resource_type: &str,
            query: &str,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = format!("{resource_type}?{query}");
            let body = self.searches.lock().unwrap().get(&key).cloned();
            Ok(BackendResponse::new(
                StatusCode::OK,
                Some(body.unwrap_or_else(
                    || json!({"resourceType": "Bundle", "type": "searchset", "entry": []}),
                )),
            ))
        }

        async fn read(
            &self,
            path: &str,
            _query: Option<&str>,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reads.lock().unwrap().get(path).cloned() {
                Some(doc) => Ok(BackendResponse::new(StatusCode::OK, Some(doc))),
                None => Ok(BackendResponse::new(
                    StatusCode::NOT_FOUND,
                    Some(json!({"resourceType": "OperationOutcome"})),
                )),
            }
        }

        async fn save(
            &self,
            _resource_type: Option<&str>,
            _body: &Value,
            _method: Method,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            unimplemented!("not used by access tests")
        }

        async fn delete(
            &self,
            _path: &str,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            unimplemented!("not used by access tests")
        }
    }

    fn patient(id: &str) -> Value {
        json!({"resourceType": "Patient", "id": id})
    }

    fn observation(subject: &str) -> Value {
        json!({
            "resourceType": "Observation",
            "id": "obs-1",
            "subject": {"reference": subject}
        })
    }

    #[tokio::test]
    async fn own_patient_record_is_visible_and_cached() {
        let backend = GraphBackend::default().with_read("Patient/1", patient("1"));
        let headers = HeaderMap::new();
        let resolver = ParticipantAccess::new(&backend, &headers);
        let known = vec!["Patient/1".to_string()];
        let mut cache = AccessCache::new();

        assert!(
            resolver
                .is_visible(&observation("Patient/1"), &known, &mut cache)
                .await
        );
        assert!(
            !resolver
                .is_visible(&observation("Patient/2"), &known, &mut cache)
                .await
        );
        assert_eq!(cache.get("Patient/1"), Some(true));
        assert_eq!(cache.get("Patient/2"), Some(false));

        // Both decisions are memoized, a replay makes no backend calls.
        let before = backend.call_count();
        assert!(
            resolver
                .is_visible(&observation("Patient/1"), &known, &mut cache)
                .await
        );
        assert!(
            !resolver
                .is_visible(&observation("Patient/2"), &known, &mut cache)
                .await
        );
        assert_eq!(backend.call_count(), before);
    }

    #[tokio::test]
    async fn non_patient_scoped_resource_is_visible() {
        let backend = GraphBackend::default();
        let headers = HeaderMap::new();
        let resolver = ParticipantAccess::new(&backend, &headers);
        let mut cache = AccessCache::new();

        let medication = json!({"resourceType": "Medication", "id": "m1"});
        assert!(resolver.is_visible(&medication, &[], &mut cache).await);
        assert!(cache.is_empty());
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn unfetchable_patient_reference_is_denied() {
        let backend = GraphBackend::default();
        let headers = HeaderMap::new();
        let resolver = ParticipantAccess::new(&backend, &headers);
        let known = vec!["Patient/9".to_string()];
        let mut cache = AccessCache::new();

        assert!(
            !resolver
                .is_visible(&observation("Patient/9"), &known, &mut cache)
                .await
        );
        assert_eq!(cache.get("Patient/9"), Some(false));
    }

    #[tokio::test]
    async fn general_practitioner_grants_visibility() {
        let backend = GraphBackend::default().with_read(
            "Patient/1",
            json!({
                "resourceType": "Patient",
                "id": "1",
                "generalPractitioner": [{"reference": "Practitioner/7"}]
            }),
        );
        let headers = HeaderMap::new();
        let resolver = ParticipantAccess::new(&backend, &headers);
        let known = vec!["Practitioner/7".to_string()];
        let mut cache = AccessCache::new();

        assert!(
            resolver
                .is_visible(&observation("Patient/1"), &known, &mut cache)
                .await
        );
        assert_eq!(cache.get("Patient/1"), Some(true));
    }

    #[tokio::test]
    async fn encounter_participation_grants_visibility() {
        let backend = GraphBackend::default()
            .with_read("Patient/1", patient("1"))
            .with_search(
                "Encounter?patient=1&participant=7",
                json!({
                    "resourceType": "Bundle",
                    "type": "searchset",
                    "entry": [{"resource": {"resourceType": "Encounter", "id": "e1"}}]
                }),
            );
        let headers = HeaderMap::new();
        let resolver = ParticipantAccess::new(&backend, &headers);
        let known = vec!["Practitioner/7".to_string()];
        let mut cache = AccessCache::new();

        assert!(
            resolver
                .is_visible(&observation("Patient/1"), &known, &mut cache)
                .await
        );
    }

    #[tokio::test]
    async fn encounter_resolves_patient_through_subject() {
        let backend = GraphBackend::default()
            .with_read(
                "Encounter/e1",
                json!({
                    "resourceType": "Encounter",
                    "id": "e1",
                    "subject": {"reference": "Patient/1"}
                }),
            )
            .with_read("Patient/1", patient("1"));
        let headers = HeaderMap::new();
        let resolver = ParticipantAccess::new(&backend, &headers);
        let known = vec!["Patient/1".to_string()];
        let mut cache = AccessCache::new();

        // References the encounter only; the patient comes from its subject.
        let report = json!({
            "resourceType": "DiagnosticReport",
            "id": "d1",
            "encounter": {"reference": "Encounter/e1"}
        });
        assert!(resolver.is_visible(&report, &known, &mut cache).await);
        assert_eq!(cache.get("Encounter/e1"), Some(true));
        assert_eq!(cache.get("Patient/1"), Some(true));
    }

    #[tokio::test]
    async fn known_identities_search_per_linkable_role() {
        let backend = GraphBackend::default().with_search(
            "Practitioner?identifier=tenant-a|dr.jones",
            json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "entry": [{"resource": {"resourceType": "Practitioner", "id": "7"}}]
            }),
        );
        let headers = HeaderMap::new();
        let resolver = ParticipantAccess::new(&backend, &headers);
        let principal = Principal {
            name: "dr.jones".into(),
            id: None,
            tenant: "tenant-a".into(),
            roles: vec!["reader".into(), "Practitioner".into()],
        };

        let identities = resolver
            .known_identities(&principal, &AccessConfig::default())
            .await;
        assert_eq!(identities, vec!["Practitioner/7".to_string()]);
        // Only the linkable role triggered a search.
        assert_eq!(backend.call_count(), 1);
    }
}
