//! Reverse-proxy address rewriting.
//!
//! Backends emit absolute links pointing at themselves (bundle `link`
//! entries, `fullUrl`, `Location` headers). Before a response leaves the
//! gateway every occurrence of the backend base address is replaced with the
//! externally visible proxy base so clients keep talking to the gateway.

use http::HeaderValue;
use http::header::LOCATION;

use fhirgate_client::BackendResponse;

pub fn reverse_proxy_response(response: &mut BackendResponse, backend_base: &str, proxy_base: &str) {
    if backend_base.is_empty() || backend_base == proxy_base {
        return;
    }
    let backend_base = backend_base.trim_end_matches('/');
    let proxy_base = proxy_base.trim_end_matches('/');

    if let Some(body) = response.body.take() {
        let text = body.to_string();
        if text.contains(backend_base) {
            let rewritten = text.replace(backend_base, proxy_base);
            response.body = serde_json::from_str(&rewritten).ok().or(Some(body));
        } else {
            response.body = Some(body);
        }
    }

    if let Some(location) = response.headers.get(LOCATION)
        && let Ok(text) = location.to_str()
        && text.contains(backend_base)
        && let Ok(value) = HeaderValue::try_from(text.replace(backend_base, proxy_base))
    {
        response.headers.insert(LOCATION, value);
    }
}
