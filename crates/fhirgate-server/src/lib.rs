//! FHIR request-mediation gateway.
//!
//! Sits between clients and a backend FHIR service, running every request
//! through a configurable pipeline: transaction bundle rewriting, patient
//! `$everything` aggregation and profile validation before the backend call,
//! participant-scoped response filtering after it.

pub mod access;
pub mod config;
pub mod observability;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod principal;
pub mod routes;
pub mod server;

pub use config::AppConfig;
pub use observability::{apply_logging_level, init_tracing};
pub use server::{AppState, GatewayServer, ServerBuilder, build_app};
