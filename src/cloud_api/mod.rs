//! Cloud API Client
//!
//! ## Responsibilities
//!
//! - Stateless request/response wrapper for the vendor cloud HTTP surface
//! - Login (password + TOTP second factor), catalog listing, payload
//!   download, live stream start/stop
//! - Typed response validation (unknown shapes fail as MalformedResponse)
//!
//! Session state (token caching, refresh) lives in `crate::session`, not
//! here; every call takes the token it should use.

#[cfg(test)]
pub mod mock;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{Error, Result};

pub use types::*;

/// OAuth client id expected by the token endpoint
const CLIENT_ID: &str = "REO-.AJ,HO/L6_TG44T78KB7";

/// Web origin the cloud API expects on account endpoints
const ACCOUNT_ORIGIN: &str = "https://my.reolink.com";

/// Web origin the cloud API expects on video endpoints
const CLOUD_ORIGIN: &str = "https://cloud.reolink.com";

/// Cloud API surface, as a trait so services can be exercised against a
/// mock client in tests.
#[async_trait]
pub trait CloudApi: Send + Sync + 'static {
    /// Exchange credentials + a fresh TOTP code for an access token
    async fn login(&self, email: &str, password: &str, totp_code: &str) -> Result<LoginResponse>;

    /// List clips created in `[start_ms, end_ms]` (epoch milliseconds)
    async fn list_videos(&self, token: &str, start_ms: i64, end_ms: i64) -> Result<Vec<CloudClip>>;

    /// Resolve the short-lived download URL for a clip's video payload
    async fn video_download_url(&self, token: &str, clip_id: &str) -> Result<String>;

    /// Fetch an artifact payload (video or thumbnail) from a resolved URL
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;

    /// Ask the cloud to start the device's live stream; returns the
    /// stream's transport URL
    async fn start_stream(&self, token: &str, device_id: &str, quality: &str) -> Result<String>;

    /// Ask the cloud to stop the device's live stream
    async fn stop_stream(&self, token: &str, device_id: &str) -> Result<()>;
}

/// Production cloud client
pub struct CloudClient {
    client: reqwest::Client,
    base_url: String,
}

impl CloudClient {
    /// Create a new client against the given API base URL
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// Parse a response body as `T`, failing closed on shape mismatches
    fn parse_json<T: serde::de::DeserializeOwned>(body: &str, context: &str) -> Result<T> {
        serde_json::from_str(body)
            .map_err(|e| Error::MalformedResponse(format!("{}: {}", context, e)))
    }
}

#[async_trait]
impl CloudApi for CloudClient {
    async fn login(&self, email: &str, password: &str, totp_code: &str) -> Result<LoginResponse> {
        let url = format!("{}/v1.0/oauth2/token/", self.base_url);
        let params = [
            ("username", email),
            ("password", password),
            ("grant_type", "password"),
            ("session_mode", "true"),
            ("client_id", CLIENT_ID),
            ("mfa_trusted", "false"),
            ("mfa_code", totp_code),
        ];

        let resp = self
            .client
            .post(&url)
            .header("accept", "application/json")
            .header("origin", ACCOUNT_ORIGIN)
            .header("referer", format!("{}/", ACCOUNT_ORIGIN))
            .header("x-verify-scenario", "users.login_with_password")
            .form(&params)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            // The token endpoint reports one-time code rejections in the
            // error body; they must be distinguishable so the caller can
            // regenerate a fresh code instead of retrying a stale one.
            let message = match Self::parse_json::<LoginErrorBody>(&body, "login error") {
                Ok(err) => err.error_description.unwrap_or(err.error),
                Err(_) => format!("HTTP {}", status),
            };
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("mfa") || lowered.contains("code") || lowered.contains("verify") {
                return Err(Error::InvalidTotp(message));
            }
            return Err(Error::Unauthorized(format!("login rejected: {}", message)));
        }

        Self::parse_json(&body, "login response")
    }

    async fn list_videos(&self, token: &str, start_ms: i64, end_ms: i64) -> Result<Vec<CloudClip>> {
        let url = format!("{}/v2/videos/", self.base_url);

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("start_at", start_ms.to_string()),
                ("end_at", end_ms.to_string()),
                ("data_type", "create_at".to_string()),
                ("page", "1".to_string()),
                ("count", "1000".to_string()),
            ])
            .bearer_auth(token)
            .header("accept", "application/json")
            .header("origin", CLOUD_ORIGIN)
            .header("referer", format!("{}/", CLOUD_ORIGIN))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => {
                Err(Error::Unauthorized("video listing rejected".to_string()))
            }
            s if s.is_success() => {
                let listing: VideoListResponse = Self::parse_json(&body, "video listing")?;
                Ok(listing.items)
            }
            s => Err(Error::Network(format!("video listing HTTP {}", s))),
        }
    }

    async fn video_download_url(&self, token: &str, clip_id: &str) -> Result<String> {
        let url = format!("{}/v2/videos/{}/url?type=download", self.base_url, clip_id);

        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .header("origin", CLOUD_ORIGIN)
            .header("referer", format!("{}/", CLOUD_ORIGIN))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => {
                Err(Error::Unauthorized("download URL rejected".to_string()))
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("clip {}", clip_id))),
            s if s.is_success() => {
                let parsed: VideoUrlResponse = Self::parse_json(&body, "download URL")?;
                Ok(parsed.url)
            }
            s => Err(Error::Network(format!("download URL HTTP {}", s))),
        }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "payload fetch HTTP {}",
                resp.status()
            )));
        }

        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn start_stream(&self, token: &str, device_id: &str, quality: &str) -> Result<String> {
        let url = format!("{}/v2/devices/{}/live/start", self.base_url, device_id);

        let resp = self
            .client
            .post(&url)
            .query(&[("quality", quality)])
            .bearer_auth(token)
            .header("accept", "application/json")
            .header("origin", CLOUD_ORIGIN)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => {
                Err(Error::Unauthorized("stream start rejected".to_string()))
            }
            s if s.is_success() => {
                let parsed: StreamStartResponse = Self::parse_json(&body, "stream start")?;
                Ok(parsed.url)
            }
            s => Err(Error::StreamStartFailed(format!(
                "device {}: HTTP {}",
                device_id, s
            ))),
        }
    }

    async fn stop_stream(&self, token: &str, device_id: &str) -> Result<()> {
        let url = format!("{}/v2/devices/{}/live/stop", self.base_url, device_id);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .header("origin", CLOUD_ORIGIN)
            .send()
            .await?;

        let status = resp.status();
        match status {
            StatusCode::UNAUTHORIZED => {
                Err(Error::Unauthorized("stream stop rejected".to_string()))
            }
            s if s.is_success() => Ok(()),
            s => Err(Error::StreamTransport(format!(
                "stop for device {}: HTTP {}",
                device_id, s
            ))),
        }
    }
}
