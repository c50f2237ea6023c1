//! Media Proxy: snapshot/clip/thumbnail byte-range streaming in front
//! of the NVR, backed by the media cache for write-through caching.
//!
//! Fetches are streamed straight from the upstream response into the cache
//! file (`MediaCache::write_atomic`), never buffered whole in memory; once
//! cached, range requests are served by seeking into the cached file.

mod range;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::config::{Settings, SettingsHandle};
use crate::error::{AppError, Result};
use crate::media_cache::MediaCache;
use crate::model::{Detection, MediaKind};
use crate::storage::EventStore;
use crate::time;

pub use range::{parse_range, ByteRange};

const READ_CHUNK: usize = 64 * 1024;

#[derive(serde::Deserialize)]
struct FrigateEventMeta {
    #[serde(default)]
    has_clip: bool,
}

pub struct MediaProxy {
    client: reqwest::Client,
    cache: Arc<MediaCache>,
    store: Arc<dyn EventStore>,
    settings: SettingsHandle,
}

impl MediaProxy {
    pub fn new(
        client: reqwest::Client,
        cache: Arc<MediaCache>,
        store: Arc<dyn EventStore>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            client,
            cache,
            store,
            settings,
        }
    }

    pub async fn snapshot(&self, external_event_id: &str, authenticated: bool) -> Result<Response> {
        let (detection, settings) = self.authorized_lookup(external_event_id, authenticated)?;
        let path = self
            .ensure_cached(&detection.external_event_id, MediaKind::Snapshot, &settings)
            .await?;
        serve_file(path, None, "image/jpeg", false).await
    }

    pub async fn clip(
        &self,
        external_event_id: &str,
        authenticated: bool,
        range_header: Option<&str>,
        head_only: bool,
    ) -> Result<Response> {
        let (detection, settings) = self.authorized_lookup(external_event_id, authenticated)?;
        if !settings.clips_enabled {
            return Err(AppError::Forbidden);
        }
        let path = self
            .ensure_cached(&detection.external_event_id, MediaKind::Clip, &settings)
            .await?;
        serve_file(path, range_header, "video/mp4", head_only).await
    }

    pub async fn vtt(&self, external_event_id: &str, authenticated: bool) -> Result<Response> {
        let (detection, settings) = self.authorized_lookup(external_event_id, authenticated)?;
        if !settings.clips_enabled {
            return Err(AppError::Forbidden);
        }
        let path = self
            .ensure_cached(&detection.external_event_id, MediaKind::Vtt, &settings)
            .await?;
        serve_file(path, None, "text/vtt", false).await
    }

    pub async fn vtt_sprite(&self, external_event_id: &str, authenticated: bool) -> Result<Response> {
        let (detection, settings) = self.authorized_lookup(external_event_id, authenticated)?;
        if !settings.clips_enabled {
            return Err(AppError::Forbidden);
        }
        let path = self
            .ensure_cached(&detection.external_event_id, MediaKind::VttSprite, &settings)
            .await?;
        serve_file(path, None, "image/jpeg", false).await
    }

    fn authorized_lookup(&self, external_event_id: &str, authenticated: bool) -> Result<(Detection, Arc<Settings>)> {
        let settings = self.settings.current();
        let detection = self
            .store
            .get_by_external_id(external_event_id)
            .context("looking up detection for media proxy")?
            .ok_or(AppError::NotFound)?;
        if !authenticated {
            guest_authorize(&detection, &settings)?;
        }
        Ok((detection, settings))
    }

    /// Queries upstream event metadata for clip availability, without
    /// downloading anything. The reclassifier checks this before any
    /// clip fetch.
    pub async fn has_clip(&self, external_event_id: &str) -> Result<bool> {
        let settings = self.settings.current();
        let base = settings.frigate_url.trim_end_matches('/');
        let url = format!("{base}/api/events/{external_event_id}");
        let mut request = self.client.get(&url);
        if let Some(token) = &settings.frigate_auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "upstream returned {}",
                response.status()
            )));
        }
        let meta: FrigateEventMeta = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        Ok(meta.has_clip)
    }

    /// Fetches and caches a detection's clip for deep reclassification.
    /// Bypasses the `clips_enabled` gate that governs the HTTP clip
    /// endpoint: reclassification is an internal, explicitly-triggered
    /// operation rather than public media serving.
    pub async fn fetch_clip_path(&self, external_event_id: &str) -> Result<PathBuf> {
        let settings = self.settings.current();
        self.ensure_cached(external_event_id, MediaKind::Clip, &settings).await
    }

    /// Fetches and caches a detection's snapshot bytes for classification.
    /// Bypasses guest authorization: internal pipeline callers are trusted,
    /// unlike the HTTP-facing `snapshot` method above.
    pub async fn fetch_snapshot_bytes(&self, external_event_id: &str) -> Result<Vec<u8>> {
        let settings = self.settings.current();
        let path = self.ensure_cached(external_event_id, MediaKind::Snapshot, &settings).await?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))
    }

    /// Returns the cached file path, fetching from upstream on a cache miss.
    /// Callers check `clips_enabled` before reaching this for clip-family
    /// kinds; snapshots are always eligible.
    async fn ensure_cached(&self, external_event_id: &str, kind: MediaKind, settings: &Settings) -> Result<PathBuf> {
        if let Some(path) = self.cache.cached(external_event_id, kind).await {
            return Ok(path);
        }

        let url = upstream_url(&settings.frigate_url, external_event_id, kind);
        let mut request = self.client.get(&url);
        if let Some(token) = &settings.frigate_auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.context("reading upstream media chunk"));

        self.cache
            .write_atomic(external_event_id, kind, chunks)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))
    }
}

fn upstream_url(frigate_url: &str, external_event_id: &str, kind: MediaKind) -> String {
    let base = frigate_url.trim_end_matches('/');
    match kind {
        MediaKind::Snapshot => format!("{base}/api/events/{external_event_id}/snapshot.jpg?crop=1&quality=95"),
        MediaKind::Clip => format!("{base}/api/events/{external_event_id}/clip.mp4"),
        MediaKind::Vtt => format!("{base}/api/events/{external_event_id}/clip-thumbnails.vtt"),
        MediaKind::VttSprite => format!("{base}/api/events/{external_event_id}/clip-thumbnails.jpg"),
    }
}

/// Denies guest access before any upstream fetch: hidden detections, ones
/// outside the public history window, and disallowed cameras are all `403`.
fn guest_authorize(detection: &Detection, settings: &Settings) -> Result<()> {
    if detection.is_hidden {
        return Err(AppError::Forbidden);
    }
    if !settings.guest_allowed_cameras.is_empty() && !settings.guest_allowed_cameras.contains(&detection.camera) {
        return Err(AppError::Forbidden);
    }
    let cutoff = time::now() - chrono::Duration::hours(settings.public_history_hours as i64);
    let detection_time = time::from_canonical(&detection.detection_time).map_err(AppError::Internal)?;
    if detection_time < cutoff {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

async fn serve_file(path: PathBuf, range_header: Option<&str>, content_type: &str, head_only: bool) -> Result<Response> {
    let metadata = tokio::fs::metadata(&path)
        .await
        .context("reading cached media file metadata")?;
    let total_len = metadata.len();

    let mut headers = HeaderMap::new();
    headers.insert("Accept-Ranges", HeaderValue::from_static("bytes"));
    headers.insert(
        "Content-Type",
        HeaderValue::from_str(content_type).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );

    let range = match range_header {
        Some(raw) => Some(parse_range(raw, total_len)?),
        None => None,
    };

    let (status, start, len) = match range {
        None => (StatusCode::OK, 0, total_len),
        Some(ByteRange { start, end }) => {
            headers.insert(
                "Content-Range",
                HeaderValue::from_str(&format!("bytes {start}-{end}/{total_len}"))
                    .expect("well-formed content-range"),
            );
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
    };
    headers.insert("Content-Length", HeaderValue::from_str(&len.to_string()).unwrap());

    if head_only {
        return Ok((status, headers).into_response());
    }

    let file = tokio::fs::File::open(&path).await.context("opening cached media file")?;
    let body = Body::from_stream(file_range_stream(file, start, len).map_err(std::io::Error::other));
    Ok((status, headers, body).into_response())
}

fn file_range_stream(
    file: tokio::fs::File,
    start: u64,
    len: u64,
) -> impl futures_util::Stream<Item = anyhow::Result<bytes::Bytes>> {
    futures_util::stream::try_unfold((file, start, len), move |(mut file, offset, remaining)| async move {
        if remaining == 0 {
            return Ok(None);
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let want = remaining.min(READ_CHUNK as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some((bytes::Bytes::from(buf), (file, offset + n as u64, remaining - n as u64))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Detection, DetectionSource, VideoClassificationStatus};
    use crate::storage::SqliteEventStore;

    fn detection(id: &str, camera: &str, hidden: bool) -> Detection {
        Detection {
            external_event_id: id.to_string(),
            camera: camera.to_string(),
            detection_time: time::to_canonical(time::now()),
            display_name: "House Sparrow".to_string(),
            category_name: "bird".to_string(),
            score: 0.9,
            source: DetectionSource::Snapshot,
            frigate_score: None,
            sub_label: None,
            audio_detected: false,
            audio_confirmed: false,
            audio_species: None,
            audio_score: None,
            video_classification_status: VideoClassificationStatus::None,
            video_classification_label: None,
            video_classification_score: None,
            temperature: None,
            weather_condition: None,
            wind_speed: None,
            cloud_cover: None,
            precipitation: None,
            scientific_name: None,
            common_name: None,
            taxa_id: None,
            is_hidden: hidden,
        }
    }

    #[test]
    fn guest_denied_for_hidden_detection() {
        let settings = Settings::default();
        let d = detection("E1", "cam1", true);
        assert!(guest_authorize(&d, &settings).is_err());
    }

    #[test]
    fn guest_denied_outside_public_window() {
        let mut settings = Settings::default();
        settings.public_history_hours = 1;
        let mut d = detection("E1", "cam1", false);
        d.detection_time = time::to_canonical(time::now() - chrono::Duration::hours(5));
        assert!(guest_authorize(&d, &settings).is_err());
    }

    #[test]
    fn guest_denied_for_disallowed_camera() {
        let mut settings = Settings::default();
        settings.guest_allowed_cameras = vec!["cam2".to_string()];
        let d = detection("E1", "cam1", false);
        assert!(guest_authorize(&d, &settings).is_err());
    }

    #[test]
    fn guest_allowed_for_visible_recent_detection() {
        let settings = Settings::default();
        let d = detection("E1", "cam1", false);
        assert!(guest_authorize(&d, &settings).is_ok());
    }

    #[tokio::test]
    async fn clip_endpoint_rejects_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 30, 1_000_000).unwrap());
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.upsert(&detection("E1", "cam1", false)).unwrap();

        let mut settings = Settings::default();
        settings.clips_enabled = false;
        let handle = SettingsHandle::new(settings);

        let proxy = MediaProxy::new(reqwest::Client::new(), cache, store, handle);
        let result = proxy.clip("E1", true, None, false).await;
        assert!(matches!(result, Err(AppError::Forbidden)));
    }
}
