//! Deep Video Reclassifier: on-demand re-classification over a
//! deterministically sampled set of frames from a detection's clip, with
//! incremental progress broadcast and soft-vote aggregation.

mod ffmpeg;
mod frame_sampling;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;

use crate::audio::AudioCorrelator;
use crate::broadcast::{BroadcastEvent, Broadcaster};
use crate::config::SettingsHandle;
use crate::detect::{is_unknown_label, soft_vote, ClassifierRuntime, LabelScore};
use crate::enrich::Enrichment;
use crate::error::{AppError, Result};
use crate::media_proxy::MediaProxy;
use crate::model::{DetectionSource, FramePrediction, ReclassificationJob, ReclassificationStatus, VideoClassificationStatus};
use crate::storage::EventStore;

const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq)]
pub enum ReclassifyOutcome {
    Completed { promoted: bool },
    Failed(String),
    NoClip,
    AlreadyRunning,
}

pub struct Reclassifier {
    store: Arc<dyn EventStore>,
    media_proxy: Arc<MediaProxy>,
    classifier: Arc<ClassifierRuntime>,
    #[allow(dead_code)]
    audio: Arc<AudioCorrelator>,
    enrichment: Arc<Enrichment>,
    broadcaster: Arc<Broadcaster>,
    settings: SettingsHandle,
    semaphore: tokio::sync::Semaphore,
    job_deadline: Duration,
    active: StdMutex<HashSet<String>>,
    jobs: StdMutex<HashMap<String, ReclassificationJob>>,
}

impl Reclassifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EventStore>,
        media_proxy: Arc<MediaProxy>,
        classifier: Arc<ClassifierRuntime>,
        audio: Arc<AudioCorrelator>,
        enrichment: Arc<Enrichment>,
        broadcaster: Arc<Broadcaster>,
        settings: SettingsHandle,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            store,
            media_proxy,
            classifier,
            audio,
            enrichment,
            broadcaster,
            settings,
            semaphore: tokio::sync::Semaphore::new(max_concurrent_jobs.max(1)),
            job_deadline: DEFAULT_JOB_DEADLINE,
            active: StdMutex::new(HashSet::new()),
            jobs: StdMutex::new(HashMap::new()),
        }
    }

    pub fn job_status(&self, external_event_id: &str) -> Option<ReclassificationJob> {
        self.jobs.lock().expect("reclassifier job map poisoned").get(external_event_id).cloned()
    }

    pub fn classifier_status(&self) -> crate::detect::ClassifierStatus {
        self.classifier.status()
    }

    pub async fn reclassify(&self, external_event_id: &str) -> Result<ReclassifyOutcome> {
        {
            let mut active = self.active.lock().expect("reclassifier active-set poisoned");
            if !active.insert(external_event_id.to_string()) {
                return Ok(ReclassifyOutcome::AlreadyRunning);
            }
        }

        let _permit = self.semaphore.acquire().await.expect("semaphore is never closed");

        let outcome = match tokio::time::timeout(self.job_deadline, self.run(external_event_id)).await {
            Ok(result) => result,
            Err(_) => {
                self.fail_job(external_event_id, "reclassification deadline exceeded");
                Ok(ReclassifyOutcome::Failed("deadline exceeded".to_string()))
            }
        };

        self.active.lock().expect("reclassifier active-set poisoned").remove(external_event_id);
        outcome
    }

    async fn run(&self, external_event_id: &str) -> Result<ReclassifyOutcome> {
        let existing = self
            .store
            .get_by_external_id(external_event_id)
            .context("looking up detection for reclassification")?
            .ok_or(AppError::NotFound)?;

        let has_clip = match self.media_proxy.has_clip(external_event_id).await {
            Ok(v) => v,
            Err(err) => {
                self.fail_job(external_event_id, &err.to_string());
                return Ok(ReclassifyOutcome::Failed(err.to_string()));
            }
        };
        if !has_clip {
            return Ok(ReclassifyOutcome::NoClip);
        }

        let clip_path = match self.media_proxy.fetch_clip_path(external_event_id).await {
            Ok(p) => p,
            Err(err) => {
                self.fail_job(external_event_id, &err.to_string());
                return Ok(ReclassifyOutcome::Failed(err.to_string()));
            }
        };

        let duration_secs = match ffmpeg::probe_duration_secs(&clip_path).await {
            Ok(d) => d,
            Err(err) => {
                self.fail_job(external_event_id, &err.to_string());
                return Ok(ReclassifyOutcome::Failed(err.to_string()));
            }
        };

        let settings = self.settings.current();
        let seed = frame_sampling::seed_from_event_id(external_event_id);
        let offsets = frame_sampling::sample_offsets_secs(duration_secs, settings.max_reclassify_frames, seed);
        if offsets.is_empty() {
            self.fail_job(external_event_id, "no frames could be sampled from clip");
            return Ok(ReclassifyOutcome::Failed("no frames could be sampled from clip".to_string()));
        }

        self.broadcaster.publish(BroadcastEvent::ReclassificationStarted {
            external_event_id: external_event_id.to_string(),
        });
        self.start_job(external_event_id, offsets.len());

        let total = offsets.len();
        let mut per_frame: Vec<Vec<LabelScore>> = Vec::with_capacity(total);

        for (index, offset) in offsets.iter().enumerate() {
            let frame_bytes = match ffmpeg::extract_frame_jpeg(&clip_path, *offset).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.fail_job(external_event_id, &err.to_string());
                    return Ok(ReclassifyOutcome::Failed(err.to_string()));
                }
            };

            let predictions = match self.classifier.classify_image(frame_bytes).await {
                Ok(predictions) => predictions,
                Err(err) => {
                    self.fail_job(external_event_id, &err.to_string());
                    return Ok(ReclassifyOutcome::Failed(err.to_string()));
                }
            };

            let top = predictions.first().cloned().unwrap_or(LabelScore {
                label: "unknown".to_string(),
                score: 0.0,
            });
            self.record_progress(external_event_id, index, &top);
            self.broadcaster.publish(BroadcastEvent::ReclassificationProgress {
                external_event_id: external_event_id.to_string(),
                current_frame: index + 1,
                total_frames: total,
                frame_index: index,
                label: top.label,
                score: top.score,
            });
            per_frame.push(predictions);
        }

        let aggregated = soft_vote(&per_frame);
        let top = aggregated.first().cloned();

        let mut updated = existing;
        updated.video_classification_status = VideoClassificationStatus::Failed;

        let mut promoted = false;
        if let Some(top) = &top {
            updated.video_classification_status = VideoClassificationStatus::Completed;
            updated.video_classification_label = Some(top.label.clone());
            updated.video_classification_score = Some(top.score);

            if top.score > updated.score && !is_unknown_label(&top.label) {
                promoted = true;
                updated.source = DetectionSource::Video;
                updated.score = top.score;
                updated.scientific_name = Some(top.label.clone());

                match self.enrichment.fetch_taxonomy(self.store.as_ref(), &top.label).await {
                    Some(entry) => {
                        updated.display_name = entry.common_name.clone();
                        updated.common_name = Some(entry.common_name);
                        updated.taxa_id = Some(entry.taxa_id);
                    }
                    None => {
                        updated.display_name = top.label.clone();
                        updated.common_name = None;
                        updated.taxa_id = None;
                    }
                }

                updated.audio_confirmed = updated.audio_detected
                    && updated
                        .audio_species
                        .as_deref()
                        .is_some_and(|species| species.eq_ignore_ascii_case(&updated.display_name))
                    && updated.audio_score.unwrap_or(0.0) >= settings.audio_confirm_score;
            }
        }

        if let Err(err) = self.store.upsert(&updated) {
            self.fail_job(external_event_id, &err.to_string());
            return Ok(ReclassifyOutcome::Failed(err.to_string()));
        }

        self.complete_job(external_event_id);
        self.broadcaster.publish(BroadcastEvent::ReclassificationCompleted {
            external_event_id: external_event_id.to_string(),
        });
        Ok(ReclassifyOutcome::Completed { promoted })
    }

    fn start_job(&self, external_event_id: &str, frames_planned: usize) {
        let mut jobs = self.jobs.lock().expect("reclassifier job map poisoned");
        jobs.insert(
            external_event_id.to_string(),
            ReclassificationJob {
                external_event_id: external_event_id.to_string(),
                frames_planned,
                frames_done: 0,
                per_frame_results: Vec::new(),
                status: ReclassificationStatus::Running,
            },
        );
    }

    fn record_progress(&self, external_event_id: &str, frame_index: usize, top: &LabelScore) {
        let mut jobs = self.jobs.lock().expect("reclassifier job map poisoned");
        if let Some(job) = jobs.get_mut(external_event_id) {
            job.frames_done = frame_index + 1;
            job.per_frame_results.push(FramePrediction {
                frame_index,
                label: top.label.clone(),
                score: top.score,
            });
        }
    }

    fn complete_job(&self, external_event_id: &str) {
        let mut jobs = self.jobs.lock().expect("reclassifier job map poisoned");
        if let Some(job) = jobs.get_mut(external_event_id) {
            job.status = ReclassificationStatus::Completed;
        }
    }

    fn fail_job(&self, external_event_id: &str, reason: &str) {
        let mut jobs = self.jobs.lock().expect("reclassifier job map poisoned");
        if let Some(job) = jobs.get_mut(external_event_id) {
            job.status = ReclassificationStatus::Failed;
        }
        drop(jobs);
        self.broadcaster.publish(BroadcastEvent::ReclassificationFailed {
            external_event_id: external_event_id.to_string(),
            reason: reason.to_string(),
        });
    }
}
