use std::net::SocketAddr;

use fhirgate_server::{AppConfig, build_app};

/// Serves the gateway on an ephemeral port and returns its base URL.
pub async fn spawn_gateway(cfg: AppConfig) -> String {
    let app = build_app(&cfg).expect("gateway should build");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server runs");
    });
    format!("http://{addr}")
}

/// Default config pointed at the given backend, authenticated with a static
/// bearer token.
pub fn gateway_config(backend_url: &str) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.backend.base_url = backend_url.to_string();
    cfg.backend.static_token = Some("test-token".into());
    cfg
}

/// Adds front-door principal headers for an authenticated caller.
pub fn as_principal(
    req: reqwest::RequestBuilder,
    name: &str,
    tenant: &str,
    roles: &str,
) -> reqwest::RequestBuilder {
    req.header("x-ms-client-principal-name", name)
        .header("x-ms-client-principal-tenant", tenant)
        .header("x-ms-client-roles", roles)
}
