//! HTTP handlers for the gateway surface.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, Method, StatusCode, Uri, header::CONTENT_TYPE};
use serde_json::json;

use fhirgate_client::BackendResponse;
use fhirgate_core::error::GatewayError;
use fhirgate_core::operation_outcome;

use crate::pipeline::RequestContext;
use crate::principal::Principal;
use crate::server::AppState;

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "fhir_base": "/fhir",
    }))
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn readyz() -> impl IntoResponse {
    Json(json!({"status": "ready"}))
}

/// Answers verbs a route does not register. Axum's bare 405 carries no
/// body; callers always receive an OperationOutcome.
pub async fn method_not_allowed(method: Method, uri: Uri) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(operation_outcome(
            "not-supported",
            &format!("{method} is not supported for {}", uri.path()),
        )),
    )
        .into_response()
}

pub async fn type_level(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    method: Method,
    RawQuery(query): RawQuery,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    dispatch(
        state,
        method,
        [Some(resource_type), None, None, None],
        query,
        headers,
        addr,
        body,
    )
    .await
}

pub async fn instance_level(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    dispatch(
        state,
        method,
        [Some(resource_type), Some(id), None, None],
        query,
        headers,
        addr,
        body,
    )
    .await
}

pub async fn history_level(
    State(state): State<AppState>,
    Path((resource_type, id, hist)): Path<(String, String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    dispatch(
        state,
        method,
        [Some(resource_type), Some(id), Some(hist), None],
        query,
        headers,
        addr,
        body,
    )
    .await
}

pub async fn version_level(
    State(state): State<AppState>,
    Path((resource_type, id, hist, vid)): Path<(String, String, String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    dispatch(
        state,
        method,
        [Some(resource_type), Some(id), Some(hist), Some(vid)],
        query,
        headers,
        addr,
        body,
    )
    .await
}

async fn dispatch(
    state: AppState,
    method: Method,
    [resource_type, id, hist, vid]: [Option<String>; 4],
    query: Option<String>,
    headers: HeaderMap,
    addr: SocketAddr,
    body: String,
) -> Response {
    let Some(principal) = Principal::from_headers(&headers) else {
        return GatewayError::unauthorized("User is not authenticated").into_response();
    };
    if let Err(reason) = principal.authorize(&method, &state.access) {
        return GatewayError::forbidden(reason).into_response();
    }
    let ctx = RequestContext::new(
        method,
        resource_type,
        id,
        hist,
        vid,
        query,
        principal,
        &headers,
        Some(addr.ip()),
    );
    into_http_response(state.orchestrator.handle(&ctx, body).await)
}

/// Maps the pipeline's normalized response onto the transport. 204 carries
/// no body; everything else is serialized JSON.
fn into_http_response(resp: BackendResponse) -> Response {
    let mut response = if resp.status == StatusCode::NO_CONTENT {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            resp.status,
            [(CONTENT_TYPE, "application/json")],
            resp.body_string(),
        )
            .into_response()
    };
    response.headers_mut().extend(resp.headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn no_content_has_empty_body() {
        let resp = into_http_response(BackendResponse::new(StatusCode::NO_CONTENT, None));
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn bodyless_success_serializes_an_empty_object() {
        let resp = into_http_response(BackendResponse::new(StatusCode::OK, None));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn retained_headers_are_copied_onto_the_response() {
        let mut backend = BackendResponse::new(
            StatusCode::CREATED,
            Some(serde_json::from_str::<Value>("{\"resourceType\":\"Patient\"}").unwrap()),
        );
        backend
            .headers
            .insert("etag", "W/\"1\"".parse().unwrap());
        let resp = into_http_response(backend);
        assert_eq!(resp.headers().get("etag").unwrap(), "W/\"1\"");
    }
}
