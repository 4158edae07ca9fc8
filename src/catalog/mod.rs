//! Catalog & Download Manager
//!
//! ## Responsibilities
//!
//! - Resolve a date into the day's clip records (cloud listing, TTL cache)
//! - Idempotent download of video/thumbnail payloads into the local store
//! - Batch download with per-clip results (partial failure, no abort)
//! - Local store scans for the panel (available dates, downloaded clips)
//!
//! Store layout: `{storage_dir}/{YYYY-MM-DD}/{clip_id}.mp4` and `.jpg`.
//! Writes go to a `.part` path first and are renamed into place, so
//! concurrent readers never observe a half-written artifact.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cloud_api::CloudApi;
use crate::error::{Error, Result};
use crate::session::SessionManager;

/// Artifact kind within a clip's pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Video,
    Thumbnail,
}

impl ArtifactKind {
    /// File extension in the local store
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "mp4",
            ArtifactKind::Thumbnail => "jpg",
        }
    }
}

/// One clip as known from the cloud catalog
#[derive(Debug, Clone, Serialize)]
pub struct ClipRecord {
    pub id: String,
    /// Creation timestamp, epoch seconds
    pub created: i64,
    /// Size in bytes (0 when the cloud listing omits it)
    pub size: u64,
    pub has_thumbnail: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// A clip that failed inside a batch download
#[derive(Debug, Clone, Serialize)]
pub struct FailedClip {
    pub clip_id: String,
    pub reason: String,
}

/// Batch download summary (partial success, not all-or-nothing)
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub date: NaiveDate,
    pub downloaded: Vec<String>,
    pub failed: Vec<FailedClip>,
}

/// A date directory in the local store
#[derive(Debug, Clone, Serialize)]
pub struct DateSummary {
    pub date: NaiveDate,
    pub video_count: usize,
}

/// An already-downloaded clip in the local store
#[derive(Debug, Clone, Serialize)]
pub struct LocalClip {
    pub id: String,
    pub size: u64,
    /// File modification time, epoch seconds
    pub created: i64,
    pub has_thumbnail: bool,
    pub video_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

struct CachedListing {
    fetched_at: Instant,
    clips: Vec<ClipRecord>,
}

/// Catalog & Download Manager instance
pub struct CatalogService<C: CloudApi> {
    api: Arc<C>,
    session: Arc<SessionManager<C>>,
    storage_dir: PathBuf,
    cache_ttl: Duration,
    /// Day listings cached per date
    listings: RwLock<HashMap<NaiveDate, CachedListing>>,
    /// Per-artifact locks so concurrent downloads of the same
    /// (date, clip, kind) collapse into one transfer
    download_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C: CloudApi> CatalogService<C> {
    /// Create a new catalog service
    pub fn new(
        api: Arc<C>,
        session: Arc<SessionManager<C>>,
        storage_dir: PathBuf,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            api,
            session,
            storage_dir,
            cache_ttl,
            listings: RwLock::new(HashMap::new()),
            download_locks: RwLock::new(HashMap::new()),
        }
    }

    // ========================================
    // Listing
    // ========================================

    /// List the day's clips, from cache when fresh.
    ///
    /// An empty day is an empty vec, not an error.
    pub async fn list_clips(&self, date: NaiveDate) -> Result<Vec<ClipRecord>> {
        {
            let listings = self.listings.read().await;
            if let Some(cached) = listings.get(&date) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.clips.clone());
                }
            }
        }

        let (start_ms, end_ms) = day_bounds_ms(date);
        let api = self.api.clone();
        let clips = self
            .with_auth_retry(|token| {
                let api = api.clone();
                async move { api.list_videos(&token, start_ms, end_ms).await }
            })
            .await?;

        let records: Vec<ClipRecord> = clips
            .into_iter()
            .map(|c| ClipRecord {
                created: c.created_at_secs(),
                size: c.size,
                has_thumbnail: c.has_thumbnail(),
                thumbnail_url: c.cover_url,
                device_id: c.device_id,
                id: c.id,
            })
            .collect();

        debug!(date = %date, count = records.len(), "Day listing fetched from cloud");

        let mut listings = self.listings.write().await;
        listings.insert(
            date,
            CachedListing {
                fetched_at: Instant::now(),
                clips: records.clone(),
            },
        );

        Ok(records)
    }

    /// Run an authenticated call; on Unauthorized, invalidate the session
    /// once and retry exactly once. A second rejection surfaces as
    /// AuthenticationFailed rather than looping.
    async fn with_auth_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let token = self.session.ensure_authenticated().await?;
        match op(token).await {
            Err(Error::Unauthorized(msg)) => {
                warn!(reason = %msg, "Authenticated call rejected, re-logging in once");
                self.session.invalidate().await;
                let token = self.session.ensure_authenticated().await?;
                match op(token).await {
                    Err(Error::Unauthorized(msg)) => Err(Error::AuthenticationFailed(format!(
                        "still unauthorized after re-login: {}",
                        msg
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    // ========================================
    // Downloads
    // ========================================

    /// Download one artifact, idempotently. Returns the local path.
    ///
    /// An existing non-zero-size artifact short-circuits without network
    /// I/O. `persist` marks the artifact as exempt from external retention
    /// cleanup; the write itself is identical either way.
    pub async fn download_clip(
        &self,
        date: NaiveDate,
        clip_id: &str,
        kind: ArtifactKind,
        persist: bool,
    ) -> Result<PathBuf> {
        validate_clip_id(clip_id)?;

        // Serialize per (date, clip, kind): a concurrent second caller
        // waits here and then hits the idempotence check inside
        let key = format!("{}/{}.{}", date, clip_id, kind.extension());
        let lock = self.artifact_lock(&key).await;
        let guard = lock.lock().await;

        let result = self.download_locked(date, clip_id, kind, persist).await;

        drop(guard);
        drop(lock);
        self.evict_artifact_lock(&key).await;

        result
    }

    async fn download_locked(
        &self,
        date: NaiveDate,
        clip_id: &str,
        kind: ArtifactKind,
        persist: bool,
    ) -> Result<PathBuf> {
        let final_path = self.artifact_path(date, clip_id, kind);
        let part_path = final_path.with_extension(format!("{}.part", kind.extension()));

        if let Ok(meta) = fs::metadata(&final_path).await {
            if meta.len() > 0 {
                // Leftover partial from an interrupted earlier attempt
                if fs::metadata(&part_path).await.is_ok() {
                    debug!(path = %part_path.display(), "Discarding stale partial artifact");
                    let _ = fs::remove_file(&part_path).await;
                }
                debug!(path = %final_path.display(), "Artifact already present, skipping download");
                return Ok(final_path);
            }
        }

        let url = self.resolve_url(date, clip_id, kind).await?;
        let payload = self
            .api
            .fetch_bytes(&url)
            .await
            .map_err(|e| Error::DownloadFailed {
                clip_id: clip_id.to_string(),
                message: e.to_string(),
            })?;

        if payload.is_empty() {
            return Err(Error::DownloadFailed {
                clip_id: clip_id.to_string(),
                message: "empty payload".to_string(),
            });
        }

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Temp write + rename: readers never see a partial file
        fs::write(&part_path, &payload).await?;
        if let Err(e) = fs::rename(&part_path, &final_path).await {
            let _ = fs::remove_file(&part_path).await;
            return Err(e.into());
        }

        info!(
            path = %final_path.display(),
            size = payload.len(),
            persist = persist,
            "Artifact downloaded"
        );

        Ok(final_path)
    }

    /// Download every clip of a date (video + thumbnail pair), continuing
    /// past per-clip failures.
    pub async fn download_all_for_date(&self, date: NaiveDate) -> Result<BatchReport> {
        let clips = self.list_clips(date).await?;

        let mut report = BatchReport {
            date,
            downloaded: Vec::new(),
            failed: Vec::new(),
        };

        for clip in &clips {
            match self
                .download_clip(date, &clip.id, ArtifactKind::Video, true)
                .await
            {
                Ok(_) => report.downloaded.push(clip.id.clone()),
                Err(e) => {
                    warn!(clip_id = %clip.id, error = %e, "Clip download failed, continuing batch");
                    report.failed.push(FailedClip {
                        clip_id: clip.id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            if clip.has_thumbnail {
                if let Err(e) = self
                    .download_clip(date, &clip.id, ArtifactKind::Thumbnail, true)
                    .await
                {
                    // Thumbnail loss does not fail the clip
                    warn!(clip_id = %clip.id, error = %e, "Thumbnail download failed");
                }
            }
        }

        info!(
            date = %date,
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            "Batch download finished"
        );

        Ok(report)
    }

    /// Resolve the payload URL for an artifact
    async fn resolve_url(&self, date: NaiveDate, clip_id: &str, kind: ArtifactKind) -> Result<String> {
        match kind {
            ArtifactKind::Video => {
                let api = self.api.clone();
                let clip_id = clip_id.to_string();
                self.with_auth_retry(|token| {
                    let api = api.clone();
                    let clip_id = clip_id.clone();
                    async move { api.video_download_url(&token, &clip_id).await }
                })
                .await
            }
            ArtifactKind::Thumbnail => {
                // Thumbnail URLs only come from the day listing
                let clips = self.list_clips(date).await?;
                clips
                    .iter()
                    .find(|c| c.id == clip_id)
                    .and_then(|c| c.thumbnail_url.clone())
                    .ok_or_else(|| Error::NotFound(format!("no thumbnail for clip {}", clip_id)))
            }
        }
    }

    // ========================================
    // Local store scans
    // ========================================

    /// Dates that have at least one downloaded clip
    pub async fn available_dates(&self) -> Result<Vec<DateSummary>> {
        let mut dates = Vec::new();

        let mut entries = match fs::read_dir(&self.storage_dir).await {
            Ok(e) => e,
            Err(_) => return Ok(dates), // store not created yet
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(date) = name.parse::<NaiveDate>() else {
                continue;
            };
            let video_count = self.count_videos(entry.path()).await?;
            if video_count > 0 {
                dates.push(DateSummary { date, video_count });
            }
        }

        dates.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(dates)
    }

    /// Already-downloaded clips for a date, newest first
    pub async fn local_clips(&self, date: NaiveDate) -> Result<Vec<LocalClip>> {
        let dir = self.storage_dir.join(date.to_string());
        let mut clips = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(clips), // nothing downloaded for this date
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".mp4") else {
                continue;
            };

            let meta = entry.metadata().await?;
            let created = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            let has_thumbnail = fs::metadata(dir.join(format!("{}.jpg", id)))
                .await
                .map(|m| m.len() > 0)
                .unwrap_or(false);

            clips.push(LocalClip {
                id: id.to_string(),
                size: meta.len(),
                created,
                has_thumbnail,
                video_url: format!("/media/{}/{}.mp4", date, id),
                thumbnail_url: has_thumbnail.then(|| format!("/media/{}/{}.jpg", date, id)),
            });
        }

        clips.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(clips)
    }

    async fn count_videos(&self, dir: PathBuf) -> Result<usize> {
        let mut count = 0;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(".mp4") {
                count += 1;
            }
        }
        Ok(count)
    }

    fn artifact_path(&self, date: NaiveDate, clip_id: &str, kind: ArtifactKind) -> PathBuf {
        self.storage_dir
            .join(date.to_string())
            .join(format!("{}.{}", clip_id, kind.extension()))
    }

    async fn artifact_lock(&self, key: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.download_locks.read().await;
            if let Some(lock) = locks.get(key) {
                return lock.clone();
            }
        }

        let mut locks = self.download_locks.write().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a keyed lock once its download finished and nobody else holds
    /// it, so the map does not grow with every clip ever downloaded. A
    /// concurrent holder keeps the strong count above the map's own
    /// reference and the entry stays.
    async fn evict_artifact_lock(&self, key: &str) {
        let mut locks = self.download_locks.write().await;
        if let Some(lock) = locks.get(key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}

/// Day bounds in epoch milliseconds (UTC), inclusive start to end of day
fn day_bounds_ms(date: NaiveDate) -> (i64, i64) {
    let start = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight always exists")
        .and_utc()
        .timestamp_millis();
    let end = start + 24 * 60 * 60 * 1000 - 1;
    (start, end)
}

/// Clip ids come from the cloud but end up as file names; keep them tame
fn validate_clip_id(clip_id: &str) -> Result<()> {
    if clip_id.is_empty() || clip_id.len() > 128 {
        return Err(Error::Validation("invalid clip id length".to_string()));
    }
    if !clip_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        || clip_id.contains("..")
    {
        return Err(Error::Validation(format!(
            "clip id contains unsafe characters: {}",
            clip_id
        )));
    }
    Ok(())
}
