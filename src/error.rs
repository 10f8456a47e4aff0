//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error type carried by response bodies; wide enough for both upstream
/// body errors and file-stream I/O errors
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// Body type every gateway response uses
pub type ResponseBody = BoxBody<Bytes, BodyError>;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No file matched a static route
    NotFound,
    /// Declared request body exceeds the configured cap
    PayloadTooLarge,
    /// Failed to connect to the upstream
    UpstreamUnreachable,
    /// Upstream did not respond within the request timeout
    UpstreamTimeout,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            GatewayErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
