//! Error taxonomy for the HTTP surface.
//!
//! Every error surfaced to an HTTP caller is one of the variants below,
//! rendered in the OpenAI error envelope `{"error":{"message","type"}}` so
//! that OpenAI-API clients can handle failures uniformly. Admission and
//! validation errors are returned synchronously and never touch the pending
//! request table.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input (400).
    #[error("{0}")]
    Validation(String),
    /// Missing or invalid PIN (401).
    #[error("Missing or invalid PIN")]
    AuthenticationFailed,
    /// Single-flight violation: the device already has a request of this
    /// kind outstanding (429).
    #[error("Device is busy with another request, try again shortly")]
    DeviceBusy,
    /// No live socket for the target device (503).
    #[error("Device '{0}' is not connected")]
    DeviceUnavailable(String),
    /// Transport failed between admission and emit, or a dependency is down
    /// (503).
    #[error("{0}")]
    ServiceUnavailable(String),
    /// No device reply within the request budget (504). Chat requests never
    /// surface this — they receive synthesized fallback text instead.
    #[error("Device did not respond within {0} seconds")]
    Timeout(u64),
    /// The device replied to a speech request without an audio payload (500).
    #[error("Device reply contained no audio data")]
    NoAudioData,
    /// The approval policy declined a tool execution (403).
    #[error("Tool '{0}' was not approved for execution")]
    ToolNotApproved(String),
    /// Unknown resource in a management route (404).
    #[error("{0}")]
    NotFound(String),
    /// Unexpected failure (500).
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status code for this error kind.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            Self::DeviceBusy => StatusCode::TOO_MANY_REQUESTS,
            Self::DeviceUnavailable(_) | Self::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ToolNotApproved(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoAudioData | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `type` string in the OpenAI error envelope.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::AuthenticationFailed => "authentication_error",
            Self::DeviceBusy => "device_busy",
            Self::DeviceUnavailable(_) | Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Timeout(_) => "timeout_error",
            Self::NoAudioData => "no_audio_data",
            Self::ToolNotApproved(_) => "tool_not_approved",
            Self::NotFound(_) => "not_found_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
