//! Error handling for the cloud camera bridge

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TOTP shared secret cannot be decoded (configuration problem, fatal)
    #[error("Invalid TOTP secret: {0}")]
    InvalidSecret(String),

    /// Login failed after bounded retries; user must reconfigure credentials
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authenticated request rejected by the cloud (token expired/revoked)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Login rejected specifically for an invalid/expired one-time code
    #[error("Invalid TOTP code: {0}")]
    InvalidTotp(String),

    /// Transient network failure talking to the cloud
    #[error("Network error: {0}")]
    Network(String),

    /// Cloud response did not match the expected shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A stream is already starting or active for the device
    #[error("Stream busy for device {0}")]
    StreamBusy(String),

    /// Cloud refused to start the stream (device offline, cloud error)
    #[error("Stream start failed: {0}")]
    StreamStartFailed(String),

    /// Transport error during an active stream
    #[error("Stream transport error: {0}")]
    StreamTransport(String),

    /// Single clip download failed (reported per-clip in batch summaries)
    #[error("Download failed for clip {clip_id}: {message}")]
    DownloadFailed { clip_id: String, message: String },

    /// Requested clip/date has no data
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::InvalidSecret(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INVALID_SECRET", msg.clone())
            }
            Error::AuthenticationFailed(msg) => {
                (StatusCode::UNAUTHORIZED, "AUTHENTICATION_FAILED", msg.clone())
            }
            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            Error::InvalidTotp(msg) => (StatusCode::UNAUTHORIZED, "INVALID_TOTP", msg.clone()),
            Error::Network(msg) => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR", msg.clone()),
            Error::MalformedResponse(msg) => {
                (StatusCode::BAD_GATEWAY, "MALFORMED_RESPONSE", msg.clone())
            }
            Error::StreamBusy(device) => (
                StatusCode::CONFLICT,
                "STREAM_BUSY",
                format!("device {} already streaming", device),
            ),
            Error::StreamStartFailed(msg) => {
                (StatusCode::BAD_GATEWAY, "STREAM_START_FAILED", msg.clone())
            }
            Error::StreamTransport(msg) => {
                (StatusCode::BAD_GATEWAY, "STREAM_TRANSPORT_ERROR", msg.clone())
            }
            Error::DownloadFailed { clip_id, message } => (
                StatusCode::BAD_GATEWAY,
                "DOWNLOAD_FAILED",
                format!("clip {}: {}", clip_id, message),
            ),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
