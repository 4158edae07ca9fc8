//! Shared API response models
//!
//! Error responses are produced by the `IntoResponse` impl on the crate
//! `Error`, so the success envelope carries no error arm.

use serde::Serialize;

use crate::session::SessionSummary;

/// Standard success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { ok: true, data }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub session: SessionSummary,
    pub stream_active: bool,
}
