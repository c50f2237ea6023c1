//! Detection Processor: the pipeline's central orchestrator. One
//! entry point, `on_nvr_event`, that takes a parsed NVR event and drives
//! it through dedup, snapshot fetch, classification, audio correlation,
//! enrichment, persistence and broadcast.
//!
//! Classifier labels are treated as scientific names (the model is
//! trained on scientific-name classes); `display_name` is the resolved
//! common name, falling back to the scientific name when taxonomy lookup
//! misses. Frigate-sourced (fast-path) candidates carry no scientific
//! name at all, since a Frigate `sub_label` is operator-configured text,
//! not a taxonomic identifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::audio::AudioCorrelator;
use crate::config::{Settings, SettingsHandle};
use crate::detect::{ClassifierRuntime, LabelScore};
use crate::enrich::Enrichment;
use crate::error::{AppError, Result};
use crate::media_proxy::MediaProxy;
use crate::model::{Detection, DetectionSource, VideoClassificationStatus};
use crate::storage::{EventStore, UpsertOutcome};
use crate::time;

const SNAPSHOT_FETCH_ATTEMPTS: u32 = 3;
const SNAPSHOT_FETCH_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvrEventType {
    New,
    Update,
    End,
}

/// Domain-level NVR event, already filtered to bird detections on
/// configured cameras by the Event Router.
#[derive(Debug, Clone)]
pub struct NvrEvent {
    pub external_event_id: String,
    pub event_type: NvrEventType,
    pub camera: String,
    pub sub_label: Option<String>,
    pub top_score: Option<f64>,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

/// What happened to an incoming event. `Dropped` carries a short reason
/// and implies nothing was persisted or broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Persisted(UpsertOutcome),
    Dropped(String),
}

struct Candidate {
    scientific_name: Option<String>,
    display_name: String,
    score: f64,
    source: DetectionSource,
    sub_label: Option<String>,
}

pub struct DetectionProcessor {
    store: Arc<dyn EventStore>,
    media_proxy: Arc<MediaProxy>,
    classifier: Arc<ClassifierRuntime>,
    audio: Arc<AudioCorrelator>,
    enrichment: Arc<Enrichment>,
    broadcaster: Arc<crate::broadcast::Broadcaster>,
    settings: SettingsHandle,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DetectionProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        media_proxy: Arc<MediaProxy>,
        classifier: Arc<ClassifierRuntime>,
        audio: Arc<AudioCorrelator>,
        enrichment: Arc<Enrichment>,
        broadcaster: Arc<crate::broadcast::Broadcaster>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            store,
            media_proxy,
            classifier,
            audio,
            enrichment,
            broadcaster,
            settings,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn on_nvr_event(&self, evt: NvrEvent) -> Result<ProcessOutcome> {
        if evt.event_type == NvrEventType::End {
            return Ok(ProcessOutcome::Dropped("end_event".to_string()));
        }

        let lock = self.lock_for(&evt.external_event_id);
        let _guard = lock.lock().await;
        let outcome = self.process_locked(&evt).await;
        self.release_lock(&evt.external_event_id, &lock);
        outcome
    }

    async fn process_locked(&self, evt: &NvrEvent) -> Result<ProcessOutcome> {
        let settings = self.settings.current();

        let snapshot_bytes = match self.fetch_snapshot_with_retry(&evt.external_event_id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(external_event_id = %evt.external_event_id, error = %err, "snapshot fetch failed, dropping event");
                return Err(err);
            }
        };

        let candidate = match self.build_candidate(evt, &settings, snapshot_bytes).await? {
            Some(candidate) => candidate,
            None => return Ok(ProcessOutcome::Dropped("below_threshold".to_string())),
        };

        let detection_time = time::to_canonical(evt.start_time);
        let sensor_id = sensor_for(&evt.camera);
        let audio_window = settings.audio_correlation_window_secs.max(0) as u32;
        let audio_match = self
            .audio
            .match_event(&sensor_id, &detection_time, audio_window)
            .context("audio correlation lookup")?;

        let (audio_detected, audio_confirmed, audio_species, audio_score) = match audio_match {
            Some(a) => {
                let confirmed = a.species.eq_ignore_ascii_case(&candidate.display_name) && a.score >= settings.audio_confirm_score;
                (true, confirmed, Some(a.species), Some(a.score))
            }
            None => (false, false, None, None),
        };

        let (display_name, common_name, taxa_id) = match &candidate.scientific_name {
            Some(scientific_name) => match self.enrichment.fetch_taxonomy(self.store.as_ref(), scientific_name).await {
                Some(entry) => (entry.common_name.clone(), Some(entry.common_name), Some(entry.taxa_id)),
                None => (candidate.display_name.clone(), None, None),
            },
            None => (candidate.display_name.clone(), None, None),
        };

        let weather = self.enrichment.fetch_weather().await;

        let detection = Detection {
            external_event_id: evt.external_event_id.clone(),
            camera: evt.camera.clone(),
            detection_time,
            display_name,
            category_name: "bird".to_string(),
            score: candidate.score,
            source: candidate.source,
            frigate_score: evt.top_score,
            sub_label: candidate.sub_label,
            audio_detected,
            audio_confirmed,
            audio_species,
            audio_score,
            video_classification_status: VideoClassificationStatus::None,
            video_classification_label: None,
            video_classification_score: None,
            temperature: weather.temperature,
            weather_condition: weather.condition,
            wind_speed: weather.wind_speed,
            cloud_cover: weather.cloud_cover,
            precipitation: weather.precipitation,
            scientific_name: candidate.scientific_name,
            common_name,
            taxa_id,
            is_hidden: false,
        };

        let outcome = self.store.upsert(&detection).context("persisting detection")?;

        match outcome {
            UpsertOutcome::Created => self.broadcaster.publish(crate::broadcast::BroadcastEvent::Detection(detection)),
            UpsertOutcome::Updated => self
                .broadcaster
                .publish(crate::broadcast::BroadcastEvent::DetectionUpdated(detection)),
            UpsertOutcome::Unchanged => {}
        }

        Ok(ProcessOutcome::Persisted(outcome))
    }

    async fn fetch_snapshot_with_retry(&self, external_event_id: &str) -> Result<Vec<u8>> {
        let deadline = Instant::now() + SNAPSHOT_FETCH_BUDGET;
        let mut backoff = Duration::from_millis(250);

        for attempt in 1..=SNAPSHOT_FETCH_ATTEMPTS {
            match self.media_proxy.fetch_snapshot_bytes(external_event_id).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    let now = Instant::now();
                    if attempt == SNAPSHOT_FETCH_ATTEMPTS || now >= deadline {
                        return Err(err);
                    }
                    tracing::warn!(external_event_id, attempt, error = %err, "snapshot fetch attempt failed, retrying");
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff *= 2;
                }
            }
        }
        unreachable!("loop always returns within its bound")
    }

    /// Fast-path/classifier/fallback decision. Returns `None` when nothing
    /// clears thresholds and fallback isn't available; the caller drops
    /// the event without persisting.
    async fn build_candidate(&self, evt: &NvrEvent, settings: &Settings, snapshot_bytes: Vec<u8>) -> Result<Option<Candidate>> {
        let non_generic_sub_label = evt.sub_label.as_deref().filter(|s| is_non_generic_sub_label(s));

        if settings.trust_frigate_sublabel {
            if let Some(sub_label) = non_generic_sub_label {
                return Ok(Some(frigate_candidate(sub_label)));
            }
        }

        let predictions = self
            .classifier
            .classify_image(snapshot_bytes)
            .await
            .map_err(AppError::Internal)?;

        let passes = |ls: &LabelScore| {
            ls.score >= settings.classification_threshold
                && ls.score >= settings.min_confidence
                && !settings.blocked_labels.iter().any(|b| b.eq_ignore_ascii_case(&ls.label))
        };

        if let Some(top) = predictions.iter().find(|ls| passes(ls)) {
            return Ok(Some(snapshot_candidate(top, evt)));
        }

        if settings.fast_path_fallback_enabled {
            if let Some(sub_label) = non_generic_sub_label {
                return Ok(Some(frigate_candidate(sub_label)));
            }
        }

        Ok(None)
    }

    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("processor lock map poisoned");
        locks.entry(id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Drops the per-key lock once nobody else is waiting on it, so the
    /// map doesn't grow forever across the process lifetime.
    fn release_lock(&self, id: &str, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().expect("processor lock map poisoned");
        if let Some(entry) = locks.get(id) {
            if Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) <= 2 {
                locks.remove(id);
            }
        }
    }
}

fn is_non_generic_sub_label(label: &str) -> bool {
    let trimmed = label.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("unknown")
}

fn frigate_candidate(sub_label: &str) -> Candidate {
    Candidate {
        scientific_name: None,
        display_name: sub_label.to_string(),
        score: 0.0,
        source: DetectionSource::Frigate,
        sub_label: Some(sub_label.to_string()),
    }
}

fn snapshot_candidate(top: &LabelScore, evt: &NvrEvent) -> Candidate {
    if crate::detect::is_unknown_label(&top.label) {
        Candidate {
            scientific_name: None,
            display_name: "Unknown Bird".to_string(),
            score: top.score,
            source: DetectionSource::Snapshot,
            sub_label: evt.sub_label.clone(),
        }
    } else {
        Candidate {
            scientific_name: Some(top.label.clone()),
            display_name: top.label.clone(),
            score: top.score,
            source: DetectionSource::Snapshot,
            sub_label: evt.sub_label.clone(),
        }
    }
}

/// Maps a camera to its paired audio sensor. Cameras and microphones are
/// provisioned 1:1 and identified by the same configured name.
fn sensor_for(camera: &str) -> String {
    camera.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ClassifierBackend, ClassifierStatus};
    use crate::media_cache::MediaCache;
    use crate::storage::SqliteEventStore;
    use anyhow::Result as AnyResult;
    use image::RgbImage;

    struct FixedBackend {
        predictions: Vec<LabelScore>,
    }

    impl ClassifierBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed-test-backend"
        }

        fn classify_image(&self, _image: &RgbImage) -> AnyResult<Vec<LabelScore>> {
            Ok(self.predictions.clone())
        }

        fn status(&self) -> ClassifierStatus {
            ClassifierStatus {
                runtime: "fixed",
                loaded: true,
                error: None,
            }
        }
    }

    fn test_event(id: &str, camera: &str, sub_label: Option<&str>) -> NvrEvent {
        NvrEvent {
            external_event_id: id.to_string(),
            event_type: NvrEventType::New,
            camera: camera.to_string(),
            sub_label: sub_label.map(str::to_string),
            top_score: Some(0.95),
            start_time: time::now(),
        }
    }

    fn tiny_jpeg() -> Vec<u8> {
        let image = RgbImage::new(4, 4);
        let mut buf = std::io::Cursor::new(Vec::new());
        image
            .write_to(&mut buf, image::ImageFormat::Jpeg)
            .expect("encode test jpeg");
        buf.into_inner()
    }

    async fn harness(
        predictions: Vec<LabelScore>,
        settings: Settings,
    ) -> (DetectionProcessor, Arc<dyn EventStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 30, 10_000_000).unwrap());
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open_in_memory().unwrap());

        let jpeg_bytes = tiny_jpeg();
        let chunks = futures_util::stream::iter(vec![Ok::<_, anyhow::Error>(bytes::Bytes::from(jpeg_bytes))]);
        cache
            .write_atomic("E1", crate::model::MediaKind::Snapshot, chunks)
            .await
            .unwrap();

        let handle = SettingsHandle::new(settings);
        let media_proxy = Arc::new(MediaProxy::new(reqwest::Client::new(), cache, store.clone(), handle.clone()));
        let classifier = Arc::new(ClassifierRuntime::new(Arc::new(FixedBackend { predictions }), Duration::from_secs(5)).unwrap());
        let audio = Arc::new(AudioCorrelator::new(store.clone(), 6));
        let enrichment = Arc::new(Enrichment::new(None, None, 0.0, 0.0));
        let broadcaster = Arc::new(crate::broadcast::Broadcaster::new());

        let processor = DetectionProcessor::new(store.clone(), media_proxy, classifier, audio, enrichment, broadcaster, handle);
        (processor, store, dir)
    }

    #[tokio::test]
    async fn fast_path_trusts_non_generic_sub_label() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = true;
        let (processor, store, _dir) = harness(vec![], settings).await;

        let outcome = processor.on_nvr_event(test_event("E1", "cam1", Some("House Sparrow"))).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Persisted(UpsertOutcome::Created));

        let detection = store.get_by_external_id("E1").unwrap().unwrap();
        assert_eq!(detection.source, DetectionSource::Frigate);
        assert_eq!(detection.score, 0.0);
        assert_eq!(detection.display_name, "House Sparrow");
    }

    #[tokio::test]
    async fn classifier_candidate_above_threshold_is_persisted() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = false;
        settings.classification_threshold = 0.5;
        settings.min_confidence = 0.3;
        let predictions = vec![LabelScore {
            label: "Cyanocitta cristata".to_string(),
            score: 0.88,
        }];
        let (processor, store, _dir) = harness(predictions, settings).await;

        let outcome = processor.on_nvr_event(test_event("E1", "cam1", None)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Persisted(UpsertOutcome::Created));

        let detection = store.get_by_external_id("E1").unwrap().unwrap();
        assert_eq!(detection.source, DetectionSource::Snapshot);
        assert_eq!(detection.scientific_name.as_deref(), Some("Cyanocitta cristata"));
    }

    #[tokio::test]
    async fn below_threshold_without_fallback_is_dropped() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = false;
        settings.fast_path_fallback_enabled = false;
        settings.classification_threshold = 0.9;
        let predictions = vec![LabelScore {
            label: "Cyanocitta cristata".to_string(),
            score: 0.4,
        }];
        let (processor, store, _dir) = harness(predictions, settings).await;

        let outcome = processor.on_nvr_event(test_event("E1", "cam1", None)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Dropped("below_threshold".to_string()));
        assert!(store.get_by_external_id("E1").unwrap().is_none());
    }

    #[tokio::test]
    async fn below_threshold_falls_back_to_sub_label() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = false;
        settings.fast_path_fallback_enabled = true;
        settings.classification_threshold = 0.9;
        let predictions = vec![LabelScore {
            label: "Cyanocitta cristata".to_string(),
            score: 0.4,
        }];
        let (processor, store, _dir) = harness(predictions, settings).await;

        let outcome = processor
            .on_nvr_event(test_event("E1", "cam1", Some("Blue Jay")))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Persisted(UpsertOutcome::Created));

        let detection = store.get_by_external_id("E1").unwrap().unwrap();
        assert_eq!(detection.source, DetectionSource::Frigate);
        assert_eq!(detection.display_name, "Blue Jay");
    }

    #[tokio::test]
    async fn blocked_label_is_treated_as_below_threshold() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = false;
        settings.fast_path_fallback_enabled = false;
        settings.classification_threshold = 0.1;
        settings.min_confidence = 0.1;
        settings.blocked_labels = vec!["cyanocitta cristata".to_string()];
        let predictions = vec![LabelScore {
            label: "Cyanocitta cristata".to_string(),
            score: 0.95,
        }];
        let (processor, store, _dir) = harness(predictions, settings).await;

        let outcome = processor.on_nvr_event(test_event("E1", "cam1", None)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Dropped("below_threshold".to_string()));
        assert!(store.get_by_external_id("E1").unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_label_is_relabeled_without_scientific_name() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = false;
        settings.classification_threshold = 0.1;
        settings.min_confidence = 0.1;
        let predictions = vec![LabelScore {
            label: "unknown".to_string(),
            score: 0.95,
        }];
        let (processor, store, _dir) = harness(predictions, settings).await;

        let outcome = processor.on_nvr_event(test_event("E1", "cam1", None)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Persisted(UpsertOutcome::Created));

        let detection = store.get_by_external_id("E1").unwrap().unwrap();
        assert_eq!(detection.display_name, "Unknown Bird");
        assert!(detection.scientific_name.is_none());
    }

    #[tokio::test]
    async fn audio_confirms_only_when_species_and_score_match() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = true;
        settings.audio_confirm_score = 0.7;
        settings.audio_correlation_window_secs = 300;
        let (processor, store, _dir) = harness(vec![], settings).await;

        processor
            .audio
            .record(crate::model::AudioEvent {
                sensor_id: "cam1".to_string(),
                species: "House Sparrow".to_string(),
                score: 0.9,
                observed_at: time::to_canonical(time::now()),
            })
            .unwrap();

        let outcome = processor.on_nvr_event(test_event("E1", "cam1", Some("House Sparrow"))).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Persisted(UpsertOutcome::Created));

        let detection = store.get_by_external_id("E1").unwrap().unwrap();
        assert!(detection.audio_detected);
        assert!(detection.audio_confirmed);
        assert_eq!(detection.audio_species.as_deref(), Some("House Sparrow"));
    }

    #[tokio::test]
    async fn end_event_is_dropped_without_processing() {
        let settings = Settings::default();
        let (processor, store, _dir) = harness(vec![], settings).await;

        let mut evt = test_event("E1", "cam1", Some("House Sparrow"));
        evt.event_type = NvrEventType::End;
        let outcome = processor.on_nvr_event(evt).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Dropped("end_event".to_string()));
        assert!(store.get_by_external_id("E1").unwrap().is_none());
    }

    #[tokio::test]
    async fn replaying_identical_update_is_idempotent() {
        let mut settings = Settings::default();
        settings.trust_frigate_sublabel = true;
        let (processor, store, _dir) = harness(vec![], settings).await;

        let evt = test_event("E1", "cam1", Some("House Sparrow"));
        let first = processor.on_nvr_event(evt.clone()).await.unwrap();
        let second = processor.on_nvr_event(evt).await.unwrap();

        assert_eq!(first, ProcessOutcome::Persisted(UpsertOutcome::Created));
        assert_eq!(second, ProcessOutcome::Persisted(UpsertOutcome::Unchanged));
        assert_eq!(store.count(&Default::default()).unwrap(), 1);
    }
}
