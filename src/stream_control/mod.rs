//! Stream Session Controller
//!
//! ## Responsibilities
//!
//! - Single-slot live stream state machine per device
//!   (Idle -> Starting -> Streaming -> Stopping -> Idle)
//! - Second concurrent start is rejected with StreamBusy, never queued
//! - Idle auto-stop timer, re-armed by activity signals, cancelled on any
//!   transition out of Streaming
//! - Cloud start/stop serialized per device so local state cannot diverge
//!   from the remote device
//!
//! The camera is battery powered; leaving a stream running without a viewer
//! drains it, so the idle timeout defaults to 300 seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cloud_api::CloudApi;
use crate::config::StreamQuality;
use crate::error::{Error, Result};
use crate::session::SessionManager;

/// Live stream session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

/// Per-device stream slot; the sole cross-request mutable state in the core
struct StreamSlot {
    state: StreamState,
    url: Option<String>,
    started_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    idle_timer: Option<JoinHandle<()>>,
    /// Bumped on every start; a stale timer that outlived its session
    /// sees a mismatch and does nothing
    generation: u64,
}

impl StreamSlot {
    fn new() -> Self {
        Self {
            state: StreamState::Idle,
            url: None,
            started_at: None,
            last_activity: None,
            idle_timer: None,
            generation: 0,
        }
    }

    fn reset_to_idle(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        self.state = StreamState::Idle;
        self.url = None;
        self.started_at = None;
        self.last_activity = None;
    }
}

/// Stream status for the HTTP surface
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub device_id: String,
    pub state: StreamState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    pub idle_timeout_secs: u64,
}

struct Inner<C: CloudApi> {
    api: Arc<C>,
    session: Arc<SessionManager<C>>,
    quality: StreamQuality,
    idle_timeout: Duration,
    /// One slot per device; the slot mutex serializes start/stop/touch
    slots: RwLock<HashMap<String, Arc<Mutex<StreamSlot>>>>,
}

/// Stream Session Controller instance. Cheap to clone; the idle timer
/// tasks hold clones.
pub struct StreamController<C: CloudApi> {
    inner: Arc<Inner<C>>,
}

impl<C: CloudApi> Clone for StreamController<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: CloudApi> StreamController<C> {
    /// Create a new controller
    pub fn new(
        api: Arc<C>,
        session: Arc<SessionManager<C>>,
        quality: StreamQuality,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                session,
                quality,
                idle_timeout,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Start the device's live stream and return its transport URL.
    ///
    /// Rejected with StreamBusy when a session is already active for the
    /// device. A start failure always lands the slot back in Idle.
    pub async fn start(&self, device_id: &str) -> Result<String> {
        let slot = self.slot_for(device_id).await;
        let mut slot = slot.lock().await;

        if slot.state != StreamState::Idle {
            return Err(Error::StreamBusy(device_id.to_string()));
        }

        slot.state = StreamState::Starting;
        slot.generation += 1;
        let generation = slot.generation;

        let start_result = async {
            let token = self.inner.session.ensure_authenticated().await?;
            self.inner
                .api
                .start_stream(&token, device_id, self.inner.quality.as_str())
                .await
        }
        .await;

        let url = match start_result {
            Ok(url) => url,
            Err(e) => {
                slot.reset_to_idle();
                warn!(device_id = %device_id, error = %e, "Stream start failed");
                return Err(match e {
                    e @ (Error::StreamStartFailed(_)
                    | Error::Unauthorized(_)
                    | Error::AuthenticationFailed(_)) => e,
                    other => Error::StreamStartFailed(other.to_string()),
                });
            }
        };

        let now = Utc::now();
        slot.state = StreamState::Streaming;
        slot.url = Some(url.clone());
        slot.started_at = Some(now);
        slot.last_activity = Some(now);
        slot.idle_timer = Some(self.arm_idle_timer(device_id.to_string(), generation));

        info!(
            device_id = %device_id,
            quality = self.inner.quality.as_str(),
            idle_timeout_sec = self.inner.idle_timeout.as_secs(),
            "Stream started"
        );

        Ok(url)
    }

    /// Signal viewer activity; re-arms the idle timer.
    ///
    /// Returns false when no stream is active (not an error: the caller's
    /// poll may simply have raced the auto-stop).
    pub async fn touch(&self, device_id: &str) -> Result<bool> {
        let slot = self.slot_for(device_id).await;
        let mut slot = slot.lock().await;

        if slot.state != StreamState::Streaming {
            return Ok(false);
        }

        slot.last_activity = Some(Utc::now());
        if let Some(timer) = slot.idle_timer.take() {
            timer.abort();
        }
        let generation = slot.generation;
        slot.idle_timer = Some(self.arm_idle_timer(device_id.to_string(), generation));

        Ok(true)
    }

    /// Stop the device's stream. Idempotent: stopping while Idle is a no-op.
    pub async fn stop(&self, device_id: &str) -> Result<()> {
        let slot = self.slot_for(device_id).await;
        let mut slot = slot.lock().await;

        if slot.state == StreamState::Idle {
            return Ok(());
        }

        self.stop_locked(&mut slot, device_id, false).await
    }

    /// Current stream status for a device
    pub async fn status(&self, device_id: &str) -> StreamStatus {
        let slot = self.slot_for(device_id).await;
        let slot = slot.lock().await;

        StreamStatus {
            device_id: device_id.to_string(),
            state: slot.state,
            url: slot.url.clone(),
            started_at: slot.started_at,
            last_activity: slot.last_activity,
            idle_timeout_secs: self.inner.idle_timeout.as_secs(),
        }
    }

    /// True when any device currently has a non-idle session
    pub async fn any_active(&self) -> bool {
        let slots = self.inner.slots.read().await;
        for slot in slots.values() {
            if slot.lock().await.state != StreamState::Idle {
                return true;
            }
        }
        false
    }

    /// Issue the cloud stop and land the slot in Idle no matter what.
    ///
    /// `from_timer` distinguishes the idle timer's own call path: the timer
    /// must not abort itself mid-stop, so its handle is dropped untouched.
    async fn stop_locked(
        &self,
        slot: &mut StreamSlot,
        device_id: &str,
        from_timer: bool,
    ) -> Result<()> {
        slot.state = StreamState::Stopping;
        if from_timer {
            let _ = slot.idle_timer.take();
        } else if let Some(timer) = slot.idle_timer.take() {
            timer.abort();
        }

        let stop_result = async {
            let token = self.inner.session.ensure_authenticated().await?;
            self.inner.api.stop_stream(&token, device_id).await
        }
        .await;

        // The slot goes Idle regardless: a failed remote stop must not
        // leave a dangling local session
        slot.reset_to_idle();

        match stop_result {
            Ok(()) => {
                info!(device_id = %device_id, from_timer = from_timer, "Stream stopped");
                Ok(())
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Cloud stop failed, slot reset to idle");
                Err(Error::StreamTransport(e.to_string()))
            }
        }
    }

    /// Spawn the cancellable idle auto-stop task
    fn arm_idle_timer(&self, device_id: String, generation: u64) -> JoinHandle<()> {
        let controller = self.clone();
        let timeout = self.inner.idle_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let slot = controller.slot_for(&device_id).await;
            let mut slot = slot.lock().await;

            // A newer session or an explicit stop may have won the race
            if slot.state != StreamState::Streaming || slot.generation != generation {
                return;
            }

            info!(
                device_id = %device_id,
                timeout_sec = timeout.as_secs(),
                "Idle timeout reached, auto-stopping stream"
            );

            if let Err(e) = controller.stop_locked(&mut slot, &device_id, true).await {
                warn!(device_id = %device_id, error = %e, "Auto-stop failed");
            }
        })
    }

    async fn slot_for(&self, device_id: &str) -> Arc<Mutex<StreamSlot>> {
        {
            let slots = self.inner.slots.read().await;
            if let Some(slot) = slots.get(device_id) {
                return slot.clone();
            }
        }

        let mut slots = self.inner.slots.write().await;
        slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamSlot::new())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_api::mock::MockCloud;
    use crate::config::Credentials;
    use std::sync::atomic::Ordering;

    fn controller(api: Arc<MockCloud>, idle_timeout: Duration) -> StreamController<MockCloud> {
        let session = Arc::new(
            SessionManager::new(
                api.clone(),
                Credentials {
                    email: "user@example.com".to_string(),
                    password: "secret".to_string(),
                    totp_secret: "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".to_string(),
                },
            )
            .with_retry_policy(3, Duration::from_millis(1)),
        );
        StreamController::new(api, session, StreamQuality::Low, idle_timeout)
    }

    #[tokio::test]
    async fn test_start_returns_stream_url() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_secs(300));

        let url = ctl.start("dev-1").await.unwrap();
        assert_eq!(url, "rtsps://stream.test/dev-1");

        let status = ctl.status("dev-1").await;
        assert_eq!(status.state, StreamState::Streaming);
        assert_eq!(status.url.as_deref(), Some("rtsps://stream.test/dev-1"));
        assert!(status.started_at.is_some());
    }

    #[tokio::test]
    async fn test_second_start_rejected_with_stream_busy() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_secs(300));

        let url = ctl.start("dev-1").await.unwrap();
        let err = ctl.start("dev-1").await.unwrap_err();
        assert!(matches!(err, Error::StreamBusy(_)));

        // State unchanged by the rejected request
        let status = ctl.status("dev-1").await;
        assert_eq!(status.state, StreamState::Streaming);
        assert_eq!(status.url.as_deref(), Some(url.as_str()));
        assert_eq!(api.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_failure_returns_to_idle() {
        let api = Arc::new(MockCloud::new());
        api.push_start_error(Error::StreamStartFailed("device offline".to_string()));
        let ctl = controller(api.clone(), Duration::from_secs(300));

        let err = ctl.start("dev-1").await.unwrap_err();
        assert!(matches!(err, Error::StreamStartFailed(_)));
        assert_eq!(ctl.status("dev-1").await.state, StreamState::Idle);

        // Slot is reusable after the failure
        assert!(ctl.start("dev-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_secs(300));

        // Stop while Idle: no-op, no cloud call
        ctl.stop("dev-1").await.unwrap();
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 0);

        ctl.start("dev-1").await.unwrap();
        ctl.stop("dev-1").await.unwrap();
        ctl.stop("dev-1").await.unwrap();
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.status("dev-1").await.state, StreamState::Idle);
    }

    #[tokio::test]
    async fn test_idle_timeout_stops_stream_once() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_millis(80));

        ctl.start("dev-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(ctl.status("dev-1").await.state, StreamState::Idle);
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_touch_resets_idle_timer() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_millis(200));

        ctl.start("dev-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctl.touch("dev-1").await.unwrap());

        // 150ms after touch: original deadline passed, stream still up
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ctl.status("dev-1").await.state, StreamState::Streaming);
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 0);

        // Well past the re-armed deadline: auto-stopped exactly once
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(ctl.status("dev-1").await.state, StreamState::Idle);
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_touch_while_idle_is_noop() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_secs(300));

        assert!(!ctl.touch("dev-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_distinct_devices_stream_independently() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_secs(300));

        ctl.start("dev-1").await.unwrap();
        ctl.start("dev-2").await.unwrap();

        assert_eq!(ctl.status("dev-1").await.state, StreamState::Streaming);
        assert_eq!(ctl.status("dev-2").await.state, StreamState::Streaming);
        assert!(ctl.any_active().await);

        ctl.stop("dev-1").await.unwrap();
        assert_eq!(ctl.status("dev-1").await.state, StreamState::Idle);
        assert_eq!(ctl.status("dev-2").await.state, StreamState::Streaming);
    }

    #[tokio::test]
    async fn test_stale_timer_does_not_kill_new_session() {
        let api = Arc::new(MockCloud::new());
        let ctl = controller(api.clone(), Duration::from_millis(120));

        // First session stopped explicitly, then a second one started;
        // the first session's timer must not fire into the second
        ctl.start("dev-1").await.unwrap();
        ctl.stop("dev-1").await.unwrap();
        ctl.start("dev-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ctl.status("dev-1").await.state, StreamState::Streaming);
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 1);
    }
}
