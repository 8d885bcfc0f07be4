//! Gateway error taxonomy and JSON error responses

use crate::orchestrator::OrchestratorError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type used by every gateway handler
pub type GatewayBody = BoxBody<Bytes, BoxError>;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Failures the gateway reports to its callers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("function '{0}' not found")]
    FunctionNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("function '{0}' already exists")]
    ServiceConflict(String),

    #[error("function '{function}' is unreachable: {detail}")]
    UpstreamUnreachable { function: String, detail: String },

    #[error("function '{function}' timed out after {timeout:?}")]
    UpstreamTimeout { function: String, timeout: Duration },

    #[error("{0}")]
    OrchestratorError(String),

    #[error("orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),
}

impl GatewayError {
    /// HTTP status this error maps to at the boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::FunctionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ServiceConflict(_) => StatusCode::CONFLICT,
            GatewayError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::OrchestratorError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::OrchestratorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Stable code for the X-Gateway-Error header and JSON body
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::FunctionNotFound(_) => "FUNCTION_NOT_FOUND",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::ServiceConflict(_) => "SERVICE_CONFLICT",
            GatewayError::UpstreamUnreachable { .. } => "UPSTREAM_UNREACHABLE",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::OrchestratorError(_) => "ORCHESTRATOR_ERROR",
            GatewayError::OrchestratorUnavailable(_) => "ORCHESTRATOR_UNAVAILABLE",
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            GatewayError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
        }
    }

    /// Render as a JSON error response
    pub fn into_response(self) -> Response<GatewayBody> {
        json_error_response(&self)
    }
}

impl From<OrchestratorError> for GatewayError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(name) => GatewayError::FunctionNotFound(name),
            OrchestratorError::Conflict(name) => GatewayError::ServiceConflict(name),
            other => GatewayError::OrchestratorError(other.to_string()),
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(error: &GatewayError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            status: error.status_code().as_u16(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Gateway-Error header
pub fn json_error_response(error: &GatewayError) -> Response<GatewayBody> {
    let body = ErrorResponse::new(error).to_json();

    Response::builder()
        .status(error.status_code())
        .header("Content-Type", "application/json")
        .header(X_GATEWAY_ERROR, error.code())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
