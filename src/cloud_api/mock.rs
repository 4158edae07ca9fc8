//! Scripted cloud API mock for service tests
//!
//! Call counts are tracked per operation; per-operation scripts let a test
//! enqueue failures for the next call(s), after which the default success
//! behavior applies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CloudApi, CloudClip, LoginResponse};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MockCloud {
    pub login_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub url_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,

    /// Errors returned by upcoming login calls, in order
    pub login_script: Mutex<VecDeque<Error>>,
    /// Errors returned by upcoming list calls, in order
    pub list_script: Mutex<VecDeque<Error>>,
    /// Errors returned by upcoming start calls, in order
    pub start_script: Mutex<VecDeque<Error>>,
    /// Clips returned by successful list calls
    pub clips: Mutex<Vec<CloudClip>>,
    /// Fail payload fetches whose URL contains this substring
    pub fail_fetch_containing: Mutex<Option<String>>,
    /// Artificial latency injected into login (widens race windows)
    pub login_delay: Mutex<Duration>,
    /// TOTP codes received by login, in order
    pub seen_totp_codes: Mutex<Vec<String>>,
    /// Token lifetime reported by successful logins
    pub expires_in: Mutex<i64>,
}

impl MockCloud {
    pub fn new() -> Self {
        let mock = Self::default();
        *mock.expires_in.lock().unwrap() = 1800;
        mock
    }

    pub fn push_login_error(&self, e: Error) {
        self.login_script.lock().unwrap().push_back(e);
    }

    pub fn push_list_error(&self, e: Error) {
        self.list_script.lock().unwrap().push_back(e);
    }

    pub fn push_start_error(&self, e: Error) {
        self.start_script.lock().unwrap().push_back(e);
    }

    pub fn set_clips(&self, clips: Vec<CloudClip>) {
        *self.clips.lock().unwrap() = clips;
    }

    pub fn clip(id: &str, created_at_ms: i64) -> CloudClip {
        CloudClip {
            id: id.to_string(),
            created_at_ms,
            cover_url: Some(format!("https://cdn.test/{}.jpg", id)),
            size: 1024,
            device_id: Some("dev-1".to_string()),
        }
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn login(&self, _email: &str, _password: &str, totp_code: &str) -> Result<LoginResponse> {
        let n = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_totp_codes
            .lock()
            .unwrap()
            .push(totp_code.to_string());

        let delay = *self.login_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.login_script.lock().unwrap().pop_front() {
            return Err(err);
        }

        Ok(LoginResponse {
            access_token: format!("tok-{}", n),
            expires_in: *self.expires_in.lock().unwrap(),
            device_ids: vec!["dev-1".to_string()],
        })
    }

    async fn list_videos(
        &self,
        _token: &str,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<CloudClip>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.list_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.clips.lock().unwrap().clone())
    }

    async fn video_download_url(&self, _token: &str, clip_id: &str) -> Result<String> {
        self.url_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://cdn.test/{}.mp4", clip_id))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref needle) = *self.fail_fetch_containing.lock().unwrap() {
            if url.contains(needle.as_str()) {
                return Err(Error::Network(format!("simulated fetch failure: {}", url)));
            }
        }
        Ok(format!("payload:{}", url).into_bytes())
    }

    async fn start_stream(&self, _token: &str, device_id: &str, _quality: &str) -> Result<String> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.start_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(format!("rtsps://stream.test/{}", device_id))
    }

    async fn stop_stream(&self, _token: &str, _device_id: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
