//! Gateway error taxonomy.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::outcome::operation_outcome;

/// Errors surfaced by the gateway itself (as opposed to backend statuses,
/// which pass through verbatim).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Access forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Invalid gateway configuration: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status this error maps to at the transport boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// FHIR issue code for the synthesized OperationOutcome.
    pub fn issue_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "login",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "invalid",
            Self::Backend(_) => "exception",
            Self::Configuration(_) => "invalid",
            Self::Internal(_) => "exception",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let outcome = operation_outcome(self.issue_code(), &self.to_string());
        (self.status(), Json(outcome)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::unauthorized("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::backend("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn issue_codes() {
        assert_eq!(GatewayError::unauthorized("x").issue_code(), "login");
        assert_eq!(GatewayError::forbidden("x").issue_code(), "forbidden");
        assert_eq!(GatewayError::internal("x").issue_code(), "exception");
    }
}
