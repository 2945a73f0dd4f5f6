//! Server assembly.
//!
//! Wires the configured token source, backend client, pipeline processors
//! and HTTP routes into one axum application.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use axum::{Router, routing::get};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use fhirgate_client::{
    FhirBackend, FhirClient, OAuthClientCredentials, StaticToken, TokenCache, TokenSource,
};

use crate::config::{AccessConfig, AppConfig};
use crate::pipeline::{Orchestrator, PostProcessor, PreProcessor};
use crate::postprocess::ParticipantFilter;
use crate::preprocess::{PatientEverything, ProfileValidation, TransformBundle};
use crate::routes;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub access: Arc<AccessConfig>,
}

pub fn build_app(cfg: &AppConfig) -> anyhow::Result<Router> {
    let backend = build_backend(cfg)?;
    let orchestrator = build_orchestrator(cfg, backend)?;
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        access: Arc::new(cfg.access.clone()),
    };
    Ok(build_router(cfg, state))
}

fn build_backend(cfg: &AppConfig) -> anyhow::Result<Arc<dyn FhirBackend>> {
    let source: Arc<dyn TokenSource> = match (&cfg.backend.auth, &cfg.backend.static_token) {
        (Some(auth), _) => Arc::new(OAuthClientCredentials::new(
            &auth.token_url,
            &auth.client_id,
            &auth.client_secret,
            &auth.resource,
        )),
        (None, Some(token)) => Arc::new(StaticToken(token.clone())),
        (None, None) => bail!("backend requires either auth or static_token"),
    };
    let tokens = Arc::new(TokenCache::new(source));
    let client = FhirClient::new(&cfg.backend.base_url, tokens, cfg.backend.timeout())
        .with_retained_headers(cfg.backend.response_headers.clone());
    Ok(Arc::new(client))
}

fn build_orchestrator(cfg: &AppConfig, backend: Arc<dyn FhirBackend>) -> anyhow::Result<Orchestrator> {
    let mut pre: Vec<Arc<dyn PreProcessor>> = Vec::new();
    for name in &cfg.pipeline.pre_processors {
        let processor: Arc<dyn PreProcessor> = match name.as_str() {
            "transform_bundle" => Arc::new(TransformBundle),
            "patient_everything" => Arc::new(PatientEverything::new(
                Arc::clone(&backend),
                cfg.everything.clone(),
            )),
            "profile_validation" => Arc::new(ProfileValidation::new(
                reqwest::Client::new(),
                cfg.validation.clone(),
            )),
            other => bail!("unknown pre-processor: {other}"),
        };
        pre.push(processor);
    }
    let mut post: Vec<Arc<dyn PostProcessor>> = Vec::new();
    for name in &cfg.pipeline.post_processors {
        let processor: Arc<dyn PostProcessor> = match name.as_str() {
            "participant_filter" => Arc::new(ParticipantFilter::new(cfg.access.clone())),
            other => bail!("unknown post-processor: {other}"),
        };
        post.push(processor);
    }
    Ok(Orchestrator::new(
        backend,
        pre,
        post,
        cfg.backend.base_url.clone(),
        cfg.proxy_base_url(),
    ))
}

fn build_router(cfg: &AppConfig, state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route(
            "/fhir/{resource_type}",
            get(routes::type_level)
                .post(routes::type_level)
                .put(routes::type_level)
                .patch(routes::type_level)
                .delete(routes::type_level),
        )
        .route(
            "/fhir/{resource_type}/{id}",
            get(routes::instance_level)
                .post(routes::instance_level)
                .put(routes::instance_level)
                .patch(routes::instance_level)
                .delete(routes::instance_level),
        )
        .route(
            "/fhir/{resource_type}/{id}/{hist}",
            get(routes::history_level).fallback(routes::method_not_allowed),
        )
        .route(
            "/fhir/{resource_type}/{id}/{hist}/{vid}",
            get(routes::version_level).fallback(routes::method_not_allowed),
        )
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(cfg.server.body_limit_bytes))
        .with_state(state)
}

pub struct GatewayServer {
    addr: SocketAddr,
    app: Router,
}

pub struct ServerBuilder {
    config: AppConfig,
}

impl ServerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn build(self) -> anyhow::Result<GatewayServer> {
        let addr = self.config.addr();
        let app = build_app(&self.config).context("building gateway application")?;
        Ok(GatewayServer { addr, app })
    }
}

impl GatewayServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
