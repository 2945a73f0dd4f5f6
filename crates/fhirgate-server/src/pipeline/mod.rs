//! Pipeline orchestration.
//!
//! Every inbound resource operation flows through the same sequence: audit
//! headers are assembled, the configured pre-processors run in order, the
//! backend is called once, the post-processors run in order, and the
//! response is rewritten to the proxy's external address. Any processor may
//! short-circuit the chain with its own response; a short-circuit without a
//! response becomes a synthesized 500 OperationOutcome, never a crash.

pub mod rewrite;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tracing::{error, info, warn};

use fhirgate_client::{BackendResponse, ClientError, FhirBackend};
use fhirgate_core::outcome::operation_outcome;

use crate::principal::Principal;

pub const AUDIT_USER_HEADER: &str = "x-fhirgate-audit-userid";
pub const AUDIT_TENANT_HEADER: &str = "x-fhirgate-audit-tenant";
pub const AUDIT_SOURCE_HEADER: &str = "x-fhirgate-audit-source";
pub const AUDIT_PROXY_HEADER: &str = "x-fhirgate-audit-proxy";

const PROXY_NAME: &str = "fhirgate";

/// Metadata of one inbound resource operation, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub resource_type: Option<String>,
    pub id: Option<String>,
    pub hist: Option<String>,
    pub vid: Option<String>,
    pub query: Option<String>,
    pub principal: Principal,
    /// Audit headers plus preserved conditional-request headers, sent with
    /// every backend call made on behalf of this request.
    pub headers: HeaderMap,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: Method,
        resource_type: Option<String>,
        id: Option<String>,
        hist: Option<String>,
        vid: Option<String>,
        query: Option<String>,
        principal: Principal,
        inbound_headers: &HeaderMap,
        source_ip: Option<IpAddr>,
    ) -> Self {
        let headers = proxy_headers(&principal, source_ip, inbound_headers);
        Self {
            method,
            resource_type,
            id,
            hist,
            vid,
            query,
            principal,
            headers,
        }
    }

    /// Backend path for this request: `Type[/id[/hist[/vid]]]`.
    pub fn target_path(&self) -> String {
        let mut path = String::new();
        for seg in [&self.resource_type, &self.id, &self.hist, &self.vid]
            .into_iter()
            .flatten()
        {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(seg);
        }
        path
    }

    /// Decoded values of one query parameter.
    pub fn query_values(&self, name: &str) -> Vec<String> {
        let Some(query) = self.query.as_deref() else {
            return Vec::new();
        };
        url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .collect()
    }
}

/// Audit headers for the principal merged with preserved conditional-request
/// headers (`ETag`, `If-*`) from the inbound request.
pub fn proxy_headers(
    principal: &Principal,
    source_ip: Option<IpAddr>,
    inbound: &HeaderMap,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "etag" || lower.starts_with("if-") {
            headers.insert(name.clone(), value.clone());
        }
    }
    insert_str(&mut headers, AUDIT_USER_HEADER, &principal.name);
    insert_str(&mut headers, AUDIT_TENANT_HEADER, &principal.tenant);
    if let Some(ip) = source_ip {
        insert_str(&mut headers, AUDIT_SOURCE_HEADER, &ip.to_string());
    }
    insert_str(&mut headers, AUDIT_PROXY_HEADER, PROXY_NAME);
    headers
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::try_from(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

/// Uniform return contract of a pre- or post-processor.
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub continue_chain: bool,
    pub error_message: Option<String>,
    /// Replacement request body for subsequent stages (pre-processors only).
    pub request_body: Option<String>,
    pub response: Option<BackendResponse>,
}

impl ProcessResult {
    /// Pass through unchanged.
    pub fn pass() -> Self {
        Self {
            continue_chain: true,
            ..Default::default()
        }
    }

    /// Continue the chain with a rewritten request body.
    pub fn rewrite(body: String) -> Self {
        Self {
            continue_chain: true,
            request_body: Some(body),
            ..Default::default()
        }
    }

    /// Stop the chain and answer with this response.
    pub fn respond(response: BackendResponse) -> Self {
        Self {
            continue_chain: false,
            response: Some(response),
            ..Default::default()
        }
    }

    /// Continue the chain, carrying the (possibly transformed) response
    /// forward. Post-processors only.
    pub fn forward(response: BackendResponse) -> Self {
        Self {
            continue_chain: true,
            response: Some(response),
            ..Default::default()
        }
    }

    /// Stop the chain without a response; the orchestrator synthesizes an
    /// internal-error document.
    pub fn halt(message: impl Into<String>) -> Self {
        Self {
            continue_chain: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// A transformation stage run before the backend call. Implementations must
/// be stateless and safe for concurrent reuse across requests, and are
/// expected to absorb their own failures into a halting `ProcessResult`.
#[async_trait]
pub trait PreProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(
        &self,
        body: &str,
        ctx: &RequestContext,
        backend: &dyn FhirBackend,
    ) -> ProcessResult;
}

/// A transformation stage run over the backend response.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(
        &self,
        response: BackendResponse,
        ctx: &RequestContext,
        backend: &dyn FhirBackend,
    ) -> ProcessResult;
}

/// Sequences pre-processors, the single backend call, post-processors and
/// response address rewriting.
pub struct Orchestrator {
    backend: Arc<dyn FhirBackend>,
    pre: Vec<Arc<dyn PreProcessor>>,
    post: Vec<Arc<dyn PostProcessor>>,
    backend_base: String,
    proxy_base: String,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn FhirBackend>,
        pre: Vec<Arc<dyn PreProcessor>>,
        post: Vec<Arc<dyn PostProcessor>>,
        backend_base: impl Into<String>,
        proxy_base: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            pre,
            post,
            backend_base: backend_base.into(),
            proxy_base: proxy_base.into(),
        }
    }

    pub async fn handle(&self, ctx: &RequestContext, body: String) -> BackendResponse {
        let mut response = self.run(ctx, body).await;
        rewrite::reverse_proxy_response(&mut response, &self.backend_base, &self.proxy_base);
        response
    }

    async fn run(&self, ctx: &RequestContext, mut body: String) -> BackendResponse {
        for processor in &self.pre {
            let result = processor.process(&body, ctx, self.backend.as_ref()).await;
            if let Some(rewritten) = result.request_body {
                body = rewritten;
            }
            if !result.continue_chain {
                return match result.response {
                    Some(response) => response,
                    None => internal_error("pre-processor", processor.name(), result.error_message),
                };
            }
        }

        info!(path = %ctx.target_path(), method = %ctx.method, "calling backend FHIR service");
        let mut response = match self.call_backend(ctx, &body).await {
            Ok(response) => response,
            Err(ClientError::InvalidRequest(msg)) => {
                return BackendResponse::new(
                    StatusCode::BAD_REQUEST,
                    Some(operation_outcome("invalid", &msg)),
                );
            }
            Err(e) => {
                error!(error = %e, "backend call failed");
                return BackendResponse::new(
                    StatusCode::BAD_GATEWAY,
                    Some(operation_outcome("exception", &e.to_string())),
                );
            }
        };

        for processor in &self.post {
            let result = processor
                .process(response, ctx, self.backend.as_ref())
                .await;
            let continue_chain = result.continue_chain;
            response = match result.response {
                Some(r) => r,
                None => {
                    return internal_error(
                        "post-processor",
                        processor.name(),
                        result.error_message,
                    );
                }
            };
            if !continue_chain {
                break;
            }
        }
        response
    }

    async fn call_backend(
        &self,
        ctx: &RequestContext,
        body: &str,
    ) -> Result<BackendResponse, ClientError> {
        let path = ctx.target_path();
        match ctx.method {
            Method::GET => {
                self.backend
                    .read(&path, ctx.query.as_deref(), &ctx.headers)
                    .await
            }
            Method::DELETE => self.backend.delete(&path, &ctx.headers).await,
            _ => {
                let parsed = serde_json::from_str(body).map_err(|e| {
                    ClientError::InvalidRequest(format!("request body is not valid JSON: {e}"))
                })?;
                self.backend
                    .save(
                        ctx.resource_type.as_deref(),
                        &parsed,
                        ctx.method.clone(),
                        &ctx.headers,
                    )
                    .await
            }
        }
    }
}

fn internal_error(stage: &str, name: &str, message: Option<String>) -> BackendResponse {
    let msg = message.unwrap_or_else(|| "no message".to_string());
    warn!(stage, processor = name, message = %msg, "processor halted without a response");
    BackendResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        Some(operation_outcome(
            "internalerror",
            &format!("A gateway {stage} ({name}) halted execution. Message is {msg}"),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct StubBackend {
        pub calls: AtomicUsize,
        pub response: Value,
    }

    impl StubBackend {
        fn ok(response: Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response,
            }
        }
    }

    #[async_trait]
    impl FhirBackend for StubBackend {
        async fn search(
            &self,
            _resource_type: &str,
            _query: &str,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BackendResponse::new(StatusCode::OK, Some(self.response.clone())))
        }

        async fn read(
            &self,
            _path: &str,
            _query: Option<&str>,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BackendResponse::new(StatusCode::OK, Some(self.response.clone())))
        }

        async fn save(
            &self,
            _resource_type: Option<&str>,
            _body: &Value,
            _method: Method,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BackendResponse::new(StatusCode::OK, Some(self.response.clone())))
        }

        async fn delete(
            &self,
            _path: &str,
            _headers: &HeaderMap,
        ) -> Result<BackendResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BackendResponse::new(StatusCode::NO_CONTENT, None))
        }
    }

    struct HaltingPre;

    #[async_trait]
    impl PreProcessor for HaltingPre {
        fn name(&self) -> &'static str {
            "halting"
        }

        async fn process(
            &self,
            _body: &str,
            _ctx: &RequestContext,
            _backend: &dyn FhirBackend,
        ) -> ProcessResult {
            ProcessResult::halt("declined")
        }
    }

    fn test_ctx(method: Method) -> RequestContext {
        RequestContext::new(
            method,
            Some("Patient".into()),
            Some("1".into()),
            None,
            None,
            None,
            Principal {
                name: "alice".into(),
                id: None,
                tenant: "tenant-a".into(),
                roles: vec!["reader".into()],
            },
            &HeaderMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn halting_pre_processor_without_response_synthesizes_500() {
        let backend = Arc::new(StubBackend::ok(json!({"resourceType": "Patient"})));
        let orchestrator = Orchestrator::new(
            backend.clone(),
            vec![Arc::new(HaltingPre)],
            vec![],
            "http://fs.internal",
            "http://proxy.example/fhir",
        );

        let resp = orchestrator.handle(&test_ctx(Method::GET), String::new()).await;
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.body.unwrap();
        assert_eq!(body["resourceType"], "OperationOutcome");
        assert_eq!(body["issue"][0]["code"], "internalerror");
        // The backend facade is never invoked.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_reaches_backend_and_rewrites_addresses() {
        let backend = Arc::new(StubBackend::ok(json!({
            "resourceType": "Patient",
            "id": "1",
            "link": [{"url": "http://fs.internal/Patient/1"}]
        })));
        let orchestrator = Orchestrator::new(
            backend.clone(),
            vec![],
            vec![],
            "http://fs.internal",
            "http://proxy.example/fhir",
        );

        let resp = orchestrator.handle(&test_ctx(Method::GET), String::new()).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(
            resp.body.unwrap()["link"][0]["url"],
            "http://proxy.example/fhir/Patient/1"
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_write_body_maps_to_400() {
        let backend = Arc::new(StubBackend::ok(json!({})));
        let orchestrator = Orchestrator::new(
            backend.clone(),
            vec![],
            vec![],
            "http://fs.internal",
            "http://proxy.example/fhir",
        );

        let resp = orchestrator
            .handle(&test_ctx(Method::POST), "not json".into())
            .await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.body.unwrap()["issue"][0]["code"], "invalid");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_builds_target_path_and_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert("if-match", "W/\"3\"".parse().unwrap());
        inbound.insert("content-type", "application/json".parse().unwrap());
        let ctx = RequestContext::new(
            Method::GET,
            Some("Patient".into()),
            Some("1".into()),
            Some("_history".into()),
            Some("2".into()),
            Some("_count=10".into()),
            Principal {
                name: "alice".into(),
                id: None,
                tenant: "tenant-a".into(),
                roles: vec![],
            },
            &inbound,
            Some("10.0.0.9".parse().unwrap()),
        );
        assert_eq!(ctx.target_path(), "Patient/1/_history/2");
        assert!(ctx.headers.contains_key("if-match"));
        assert!(!ctx.headers.contains_key("content-type"));
        assert_eq!(ctx.headers.get(AUDIT_USER_HEADER).unwrap(), "alice");
        assert_eq!(ctx.headers.get(AUDIT_SOURCE_HEADER).unwrap(), "10.0.0.9");
    }

    #[test]
    fn query_values_decodes_parameters() {
        let ctx = RequestContext {
            query: Some("ms-fp-profile=http%3A%2F%2Fx%2Fp1&ms-fp-profile=p2&other=1".into()),
            ..test_ctx(Method::POST)
        };
        assert_eq!(ctx.query_values("ms-fp-profile"), vec!["http://x/p1", "p2"]);
        assert!(ctx.query_values("missing").is_empty());
    }
}
