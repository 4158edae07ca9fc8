//! Typed cloud API records
//!
//! Responses are validated at the deserialization boundary: required fields
//! that are missing make the whole response fail as `MalformedResponse`
//! rather than propagating defaults where the value matters.

use serde::Deserialize;

/// Default token lifetime when the server omits `expires_in` (seconds)
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 1800;

/// Successful login response from the token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    /// Server-declared token lifetime in seconds
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    /// Devices bound to the account
    #[serde(default)]
    pub device_ids: Vec<String>,
}

fn default_expires_in() -> i64 {
    DEFAULT_TOKEN_LIFETIME_SECS
}

/// Error payload returned by the token endpoint on login failure
#[derive(Debug, Clone, Deserialize)]
pub struct LoginErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// One recorded clip as listed by the cloud catalog
#[derive(Debug, Clone, Deserialize)]
pub struct CloudClip {
    /// Cloud-assigned clip identifier, unique within a device+day
    pub id: String,
    /// Creation timestamp in epoch milliseconds
    #[serde(rename = "createdAt")]
    pub created_at_ms: i64,
    /// Thumbnail URL, when the clip has one
    #[serde(rename = "coverUrl", default)]
    pub cover_url: Option<String>,
    /// Clip size in bytes (0 when the listing omits it)
    #[serde(default)]
    pub size: u64,
    /// Owning device identifier
    #[serde(rename = "deviceId", default)]
    pub device_id: Option<String>,
}

impl CloudClip {
    /// Creation timestamp in epoch seconds
    pub fn created_at_secs(&self) -> i64 {
        self.created_at_ms / 1000
    }

    pub fn has_thumbnail(&self) -> bool {
        self.cover_url.is_some()
    }
}

/// Catalog listing envelope: `{ "items": [...] }`
#[derive(Debug, Clone, Deserialize)]
pub struct VideoListResponse {
    pub items: Vec<CloudClip>,
}

/// Download URL resolution response
#[derive(Debug, Clone, Deserialize)]
pub struct VideoUrlResponse {
    pub url: String,
}

/// Live stream start acknowledgment
#[derive(Debug, Clone, Deserialize)]
pub struct StreamStartResponse {
    /// Transport URL for the active stream
    pub url: String,
}
