//! Session Manager
//!
//! ## Responsibilities
//!
//! - Login with email + password + freshly generated TOTP code
//! - Token caching with an expiry safety margin
//! - Single-flight refresh: overlapping callers share one login exchange,
//!   success and failure alike
//! - Bounded exponential backoff on login failure
//!
//! The vendor exposes no separate refresh grant, so "refresh" is a fresh
//! password+TOTP login. The cached session is the only holder of the access
//! token; callers receive the token string for request injection and
//! nothing else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cloud_api::CloudApi;
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::totp;

/// Seconds before expiry at which the cached token is considered stale
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Default maximum login attempts before surfacing AuthenticationFailed
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff base between login attempts
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Backoff cap
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Cached cloud session
#[derive(Debug, Clone)]
struct Session {
    access_token: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    device_ids: Vec<String>,
}

impl Session {
    /// Valid means non-expired beyond the safety margin
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS)
    }
}

/// Outcome of a failed login exchange, memoized so callers queued behind
/// the losing attempt receive its error instead of re-logging-in
struct LoginFailure {
    /// Exchange number that produced this failure
    epoch: u64,
    message: String,
}

struct SessionSlot {
    session: Option<Session>,
    last_failure: Option<LoginFailure>,
}

/// Read-only session summary for health reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub authenticated: bool,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub device_count: usize,
}

/// Session Manager instance
pub struct SessionManager<C: CloudApi> {
    api: Arc<C>,
    credentials: Credentials,
    /// Cached session; the lock is held across login so concurrent
    /// ensure_authenticated calls collapse into one network exchange
    slot: Mutex<SessionSlot>,
    /// Count of finished login exchanges. A memoized failure is relevant
    /// for a caller iff its exchange finished after the caller arrived.
    completed_logins: AtomicU64,
    max_attempts: u32,
    backoff_base: Duration,
}

impl<C: CloudApi> SessionManager<C> {
    /// Create a new session manager
    pub fn new(api: Arc<C>, credentials: Credentials) -> Self {
        Self {
            api,
            credentials,
            slot: Mutex::new(SessionSlot {
                session: None,
                last_failure: None,
            }),
            completed_logins: AtomicU64::new(0),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// Override the retry policy (tests use a zero backoff)
    pub fn with_retry_policy(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    /// Return a valid, non-expired access token, logging in if needed.
    ///
    /// Holding the session lock across the login gives single-flight
    /// semantics: waiters share the winner's outcome. On success they reuse
    /// its token; on failure they receive its error instead of mounting
    /// their own retry loop against the auth endpoint.
    pub async fn ensure_authenticated(&self) -> Result<String> {
        let completed_at_entry = self.completed_logins.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;

        if let Some(session) = slot.session.as_ref() {
            if session.is_valid(Utc::now()) {
                return Ok(session.access_token.clone());
            }
            debug!(expires_at = %session.expires_at, "Cached token stale, re-logging in");
        }

        // An exchange that finished after this caller arrived already
        // failed; hand over its outcome. Callers arriving later see a
        // higher completed count and get a fresh attempt.
        if let Some(failure) = slot.last_failure.as_ref() {
            if failure.epoch > completed_at_entry {
                return Err(Error::AuthenticationFailed(failure.message.clone()));
            }
        }

        // Exchanges are serialized by the slot lock, so this number is
        // stable for the duration of the call
        let epoch = self.completed_logins.load(Ordering::SeqCst) + 1;
        let outcome = self.login_with_retry().await;
        self.completed_logins.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(session) => {
                let token = session.access_token.clone();
                slot.session = Some(session);
                slot.last_failure = None;
                Ok(token)
            }
            Err(e) => {
                slot.last_failure = Some(LoginFailure {
                    epoch,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Discard the cached session (used after a 401 on an authenticated
    /// call). Also clears any memoized login failure.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        slot.last_failure = None;
        if slot.session.take().is_some() {
            info!("Session invalidated");
        }
    }

    /// First device id bound to the account, if a session exists
    pub async fn primary_device_id(&self) -> Option<String> {
        let slot = self.slot.lock().await;
        slot.session
            .as_ref()
            .and_then(|s| s.device_ids.first().cloned())
    }

    /// Session summary for the health endpoint
    pub async fn summary(&self) -> SessionSummary {
        let slot = self.slot.lock().await;
        match slot.session.as_ref() {
            Some(s) => SessionSummary {
                authenticated: s.is_valid(Utc::now()),
                issued_at: Some(s.issued_at),
                expires_at: Some(s.expires_at),
                device_count: s.device_ids.len(),
            },
            None => SessionSummary {
                authenticated: false,
                issued_at: None,
                expires_at: None,
                device_count: 0,
            },
        }
    }

    /// Login with bounded exponential backoff.
    ///
    /// Every attempt generates a fresh TOTP code: a rejected code must never
    /// be reused, since the previous attempt may have consumed it or its
    /// window may have passed during the backoff sleep.
    async fn login_with_retry(&self) -> Result<Session> {
        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.max_attempts {
            // InvalidSecret is a configuration problem; retrying cannot help
            let code = totp::generate_now(&self.credentials.totp_secret)?;

            let issued_at = Utc::now();
            match self
                .api
                .login(&self.credentials.email, &self.credentials.password, &code)
                .await
            {
                Ok(resp) => {
                    let expires_at = issued_at + chrono::Duration::seconds(resp.expires_in);
                    info!(
                        attempt = attempt,
                        expires_at = %expires_at,
                        devices = resp.device_ids.len(),
                        "Login successful"
                    );
                    return Ok(Session {
                        access_token: resp.access_token,
                        issued_at,
                        expires_at,
                        device_ids: resp.device_ids,
                    });
                }
                Err(e @ Error::InvalidSecret(_)) => return Err(e),
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Login attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < self.max_attempts {
                let backoff = self
                    .backoff_base
                    .saturating_mul(1 << (attempt - 1))
                    .min(BACKOFF_CAP);
                tokio::time::sleep(backoff).await;
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(Error::AuthenticationFailed(format!(
            "login failed after {} attempts: {}",
            self.max_attempts, reason
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_api::mock::MockCloud;
    use std::sync::atomic::Ordering;

    fn credentials() -> Credentials {
        Credentials {
            email: "user@example.com".to_string(),
            password: "secret".to_string(),
            // RFC 6238 test secret
            totp_secret: "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".to_string(),
        }
    }

    fn manager(api: Arc<MockCloud>) -> SessionManager<MockCloud> {
        SessionManager::new(api, credentials())
            .with_retry_policy(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_single_flight_login() {
        let api = Arc::new(MockCloud::new());
        *api.login_delay.lock().unwrap() = Duration::from_millis(20);
        let mgr = Arc::new(manager(api.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move { mgr.ensure_authenticated().await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }

        // Concurrent callers collapsed into exactly one network login
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failed_login_shares_outcome() {
        let api = Arc::new(MockCloud::new());
        *api.login_delay.lock().unwrap() = Duration::from_millis(20);
        // Enough scripted failures that every caller could burn its own
        // retry budget if outcomes were not shared
        for _ in 0..12 {
            api.push_login_error(Error::Unauthorized("cloud outage".to_string()));
        }
        let mgr = Arc::new(manager(api.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move { mgr.ensure_authenticated().await }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::AuthenticationFailed(_)));
        }

        // Only the winning caller's bounded retries hit the network;
        // the queued callers received the memoized failure
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_memoized_failure_does_not_poison_later_calls() {
        let api = Arc::new(MockCloud::new());
        for _ in 0..3 {
            api.push_login_error(Error::Unauthorized("bad credentials".to_string()));
        }
        let mgr = manager(api.clone());

        let err = mgr.ensure_authenticated().await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 3);

        // A call arriving after the failed exchange gets a fresh attempt
        assert!(mgr.ensure_authenticated().await.is_ok());
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cached_token_reused() {
        let api = Arc::new(MockCloud::new());
        let mgr = manager(api.clone());

        let t1 = mgr.ensure_authenticated().await.unwrap();
        let t2 = mgr.ensure_authenticated().await.unwrap();
        assert_eq!(t1, t2);
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_token_triggers_relogin() {
        let api = Arc::new(MockCloud::new());
        // Shorter than the 60s safety margin: immediately stale
        *api.expires_in.lock().unwrap() = 30;
        let mgr = manager(api.clone());

        let t1 = mgr.ensure_authenticated().await.unwrap();
        let t2 = mgr.ensure_authenticated().await.unwrap();
        assert_ne!(t1, t2);
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_login() {
        let api = Arc::new(MockCloud::new());
        let mgr = manager(api.clone());

        mgr.ensure_authenticated().await.unwrap();
        mgr.invalidate().await;
        mgr.ensure_authenticated().await.unwrap();
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bounded_retries_surface_authentication_failed() {
        let api = Arc::new(MockCloud::new());
        api.push_login_error(Error::Unauthorized("bad credentials".to_string()));
        api.push_login_error(Error::Unauthorized("bad credentials".to_string()));
        api.push_login_error(Error::Unauthorized("bad credentials".to_string()));
        let mgr = manager(api.clone());

        let err = mgr.ensure_authenticated().await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fresh_totp_code_per_attempt() {
        let api = Arc::new(MockCloud::new());
        api.push_login_error(Error::InvalidTotp("code expired".to_string()));
        let mgr = manager(api.clone());

        mgr.ensure_authenticated().await.unwrap();

        let codes = api.seen_totp_codes.lock().unwrap().clone();
        assert_eq!(codes.len(), 2);
        for code in &codes {
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_invalid_secret_is_fatal_without_network_calls() {
        let api = Arc::new(MockCloud::new());
        let creds = Credentials {
            totp_secret: "not base32 !!".to_string(),
            ..credentials()
        };
        let mgr = SessionManager::new(api.clone(), creds)
            .with_retry_policy(3, Duration::from_millis(1));

        let err = mgr.ensure_authenticated().await.unwrap_err();
        assert!(matches!(err, Error::InvalidSecret(_)));
        assert_eq!(api.login_calls.load(Ordering::SeqCst), 0);
    }
}
