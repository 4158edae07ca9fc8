//! Application configuration
//!
//! All settings come from environment variables (a `.env` file is loaded in
//! `main`). Credentials are supplied once at startup and never change for
//! the process lifetime.

use std::path::PathBuf;
use std::time::Duration;

/// Live stream quality selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamQuality {
    /// Low bandwidth (battery-friendly, default)
    Low,
    /// High quality
    High,
}

impl StreamQuality {
    /// Value sent to the cloud API
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamQuality::Low => "low",
            StreamQuality::High => "high",
        }
    }

    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "high" => StreamQuality::High,
            _ => StreamQuality::Low,
        }
    }
}

/// Cloud account credentials (immutable for the process lifetime)
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    /// Base32-encoded TOTP shared secret
    pub totp_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print password or TOTP secret
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Cloud account credentials
    pub credentials: Credentials,
    /// Cloud API base URL
    pub api_base: String,
    /// Local media storage root (date-partitioned)
    pub storage_dir: PathBuf,
    /// Live stream idle timeout
    pub idle_timeout: Duration,
    /// Stream quality selector
    pub stream_quality: StreamQuality,
    /// Catalog listing cache TTL
    pub list_cache_ttl: Duration,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials {
                email: std::env::var("CLOUD_EMAIL").unwrap_or_default(),
                password: std::env::var("CLOUD_PASSWORD").unwrap_or_default(),
                totp_secret: std::env::var("CLOUD_TOTP_SECRET").unwrap_or_default(),
            },
            api_base: std::env::var("CLOUD_API_BASE")
                .unwrap_or_else(|_| "https://apis.reolink.com".to_string()),
            storage_dir: std::env::var("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/cloudcam/media")),
            idle_timeout: Duration::from_secs(
                std::env::var("IDLE_TIMEOUT_SEC")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            stream_quality: std::env::var("STREAM_QUALITY")
                .map(|v| StreamQuality::parse(&v))
                .unwrap_or(StreamQuality::Low),
            list_cache_ttl: Duration::from_secs(
                std::env::var("LIST_CACHE_TTL_SEC")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        }
    }
}

impl AppConfig {
    /// Validate startup configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.credentials.email.is_empty() {
            return Err(crate::error::Error::Validation(
                "CLOUD_EMAIL is required".to_string(),
            ));
        }
        if self.credentials.password.is_empty() {
            return Err(crate::error::Error::Validation(
                "CLOUD_PASSWORD is required".to_string(),
            ));
        }
        if self.credentials.totp_secret.is_empty() {
            return Err(crate::error::Error::Validation(
                "CLOUD_TOTP_SECRET is required".to_string(),
            ));
        }
        Ok(())
    }
}
