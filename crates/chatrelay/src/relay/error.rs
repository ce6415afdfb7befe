//! Request- and stream-level error handling for the relay
//!
//! Two families of failure exist:
//! - `ProxyError`: anything that goes wrong before an SSE stream is opened.
//!   These become a JSON error response with an appropriate status.
//! - `StreamFault`: the upstream body failing after streaming has begun.
//!   These never become HTTP errors; the session reports them in-band.

use axum::{
    body::Body,
    http::{Response, StatusCode, header},
    response::IntoResponse,
};
use thiserror::Error;

/// Errors that can occur before the downstream stream is opened
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Upstream API answered with a non-success status
    #[error("Upstream error {}: {body}", .status.as_u16())]
    Upstream { status: StatusCode, body: String },

    /// Client request could not be parsed
    #[error("Invalid request: {0}")]
    Request(String),

    /// Network-level error (connection refused, reset, TLS, proxy)
    #[error("Network error: {0}")]
    Network(String),

    /// The overall request deadline passed before upstream answered
    #[error("Upstream request timed out: {0}")]
    Timeout(String),

    /// Anything else
    #[error("Internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status returned to the client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Request(_) => StatusCode::BAD_REQUEST,
            ProxyError::Network(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error category used for the JSON `type` field and for logging
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::Request(_) => "invalid_request_error",
            ProxyError::Network(_) => "proxy_error",
            ProxyError::Timeout(_) => "timeout_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        match &self {
            ProxyError::Upstream { status, body } => tracing::error!(
                error_type = self.category(),
                status = status.as_u16(),
                body_length = body.len(),
                "Upstream returned error, relaying status to client"
            ),
            _ => tracing::error!(
                error_type = self.category(),
                error_message = %self,
                "Request failed before streaming"
            ),
        }

        create_error_response(self.status(), self.category(), &self.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::Timeout(e.to_string())
        } else if e.is_connect() {
            ProxyError::Network(format!("Failed to connect to upstream: {e}"))
        } else if e.is_builder() {
            ProxyError::Internal(e.to_string())
        } else {
            ProxyError::Network(format!("Request failed: {e}"))
        }
    }
}

/// Failure of the upstream body after streaming has started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// Connection dropped or the body was cut short; worth polling again
    #[error("Upstream stream interrupted: {0}")]
    Transient(String),

    /// The request deadline passed mid-stream
    #[error("Upstream stream timed out: {0}")]
    Timeout(String),

    /// Any other transport failure
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for StreamFault {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StreamFault::Timeout(e.to_string())
        } else if e.is_body() || e.is_decode() || e.is_connect() || e.is_request() {
            StreamFault::Transient(e.to_string())
        } else {
            StreamFault::Other(e.to_string())
        }
    }
}

/// Create a JSON error response
pub fn create_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
