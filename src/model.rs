//! Core domain types.
//!
//! `Detection` is owned by the event store and mutated only through
//! repository operations (`storage::EventStore`); nothing else reaches
//! into its fields directly once persisted.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Snapshot,
    Video,
    Frigate,
    Manual,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionSource::Snapshot => "snapshot",
            DetectionSource::Video => "video",
            DetectionSource::Frigate => "frigate",
            DetectionSource::Manual => "manual",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoClassificationStatus {
    #[default]
    None,
    InProgress,
    Completed,
    Failed,
}

impl VideoClassificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoClassificationStatus::None => "none",
            VideoClassificationStatus::InProgress => "in_progress",
            VideoClassificationStatus::Completed => "completed",
            VideoClassificationStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "in_progress" => VideoClassificationStatus::InProgress,
            "completed" => VideoClassificationStatus::Completed,
            "failed" => VideoClassificationStatus::Failed,
            _ => VideoClassificationStatus::None,
        }
    }
}

/// A single persisted bird detection.
///
/// Invariants (enforced by `storage::SqliteEventStore::upsert`, not by
/// construction — callers build this incrementally through the pipeline):
/// - `external_event_id` is unique; writes are upserts keyed on it.
/// - `source == Frigate` implies `score == 0.0` and `sub_label.is_some()`.
/// - `audio_confirmed` implies `audio_detected`.
/// - `video_classification_status == Completed` implies
///   `video_classification_label.is_some()`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    pub external_event_id: String,
    pub camera: String,
    pub detection_time: String,
    pub display_name: String,
    pub category_name: String,
    pub score: f64,
    pub source: DetectionSource,
    pub frigate_score: Option<f64>,
    pub sub_label: Option<String>,

    pub audio_detected: bool,
    pub audio_confirmed: bool,
    pub audio_species: Option<String>,
    pub audio_score: Option<f64>,

    pub video_classification_status: VideoClassificationStatus,
    pub video_classification_label: Option<String>,
    pub video_classification_score: Option<f64>,

    pub temperature: Option<f64>,
    pub weather_condition: Option<String>,
    pub wind_speed: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub precipitation: Option<f64>,

    pub scientific_name: Option<String>,
    pub common_name: Option<String>,
    pub taxa_id: Option<String>,

    #[serde(default)]
    pub is_hidden: bool,
}

impl Detection {
    /// True if `self` is internally consistent with the invariants above.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        if self.source == DetectionSource::Frigate {
            if self.score != 0.0 {
                anyhow::bail!("frigate-source detection must have score == 0");
            }
            if self.sub_label.is_none() {
                anyhow::bail!("frigate-source detection must carry a sub_label");
            }
        }
        if self.audio_confirmed && !self.audio_detected {
            anyhow::bail!("audio_confirmed requires audio_detected");
        }
        if self.video_classification_status == VideoClassificationStatus::Completed
            && self.video_classification_label.is_none()
        {
            anyhow::bail!("completed video classification requires a label");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub scientific_name: String,
    pub common_name: String,
    pub taxa_id: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioEvent {
    pub sensor_id: String,
    pub species: String,
    pub score: f64,
    pub observed_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Snapshot,
    Clip,
    VttSprite,
    Vtt,
}

#[derive(Clone, Debug)]
pub struct MediaCacheEntry {
    pub external_event_id: String,
    pub kind: MediaKind,
    pub path: std::path::PathBuf,
    pub size: u64,
    pub created_at: String,
    pub last_access_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclassificationStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FramePrediction {
    pub frame_index: usize,
    pub label: String,
    pub score: f64,
}

/// Ephemeral in-memory job state for a deep-video reclassification run.
#[derive(Clone, Debug)]
pub struct ReclassificationJob {
    pub external_event_id: String,
    pub frames_planned: usize,
    pub frames_done: usize,
    pub per_frame_results: Vec<FramePrediction>,
    pub status: ReclassificationStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Newest,
    Oldest,
    Confidence,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "newest" => Some(SortOrder::Newest),
            "oldest" => Some(SortOrder::Oldest),
            "confidence" => Some(SortOrder::Confidence),
            _ => None,
        }
    }
}

/// Query filters accepted by `storage::EventStore::list`/`count`.
#[derive(Clone, Debug, Default)]
pub struct DetectionFilters {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub camera: Option<String>,
    pub species: Option<String>,
    pub min_score: Option<f64>,
    pub audio_confirmed: Option<bool>,
    pub include_hidden: bool,
}
