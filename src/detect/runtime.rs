//! Classifier Runtime: one active model at a time, swapped behind a
//! single writer lock while readers dereference an immutable handle
//! captured at call time. Inference runs on a `rayon` pool sized from
//! host CPU count so it never blocks the async control plane; results
//! are bridged back via `tokio::sync::oneshot`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::backend::{ClassifierBackend, ClassifierStatus, LabelScore};

pub struct ClassifierRuntime {
    active: RwLock<Arc<dyn ClassifierBackend>>,
    pool: rayon::ThreadPool,
    deadline: Duration,
}

impl ClassifierRuntime {
    pub fn new(backend: Arc<dyn ClassifierBackend>, deadline: Duration) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_cpus::get())
            .thread_name(|i| format!("classifier-worker-{i}"))
            .build()?;
        Ok(Self {
            active: RwLock::new(backend),
            pool,
            deadline,
        })
    }

    /// Copy-on-write swap of the active model.
    pub fn swap(&self, backend: Arc<dyn ClassifierBackend>) {
        let mut guard = self.active.write().expect("classifier lock poisoned");
        *guard = backend;
    }

    fn current(&self) -> Arc<dyn ClassifierBackend> {
        self.active.read().expect("classifier lock poisoned").clone()
    }

    pub fn status(&self) -> ClassifierStatus {
        self.current().status()
    }

    /// Classifies one image into labeled scores sorted descending.
    /// Decoding and inference both run on the worker pool; a timeout
    /// surfaces as `inference_timeout`.
    pub async fn classify_image(&self, image_bytes: Vec<u8>) -> Result<Vec<LabelScore>> {
        let backend = self.current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pool.spawn(move || {
            let result = decode_and_classify(backend.as_ref(), &image_bytes);
            let _ = tx.send(result);
        });

        match tokio::time::timeout(self.deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow!("classifier worker dropped before responding")),
            Err(_) => Err(anyhow!("inference_timeout")),
        }
    }

    /// Classifies a sequence of frames and aggregates them via soft
    /// voting. Frames are classified sequentially from the caller's
    /// perspective but each submission still runs on the bounded worker
    /// pool.
    pub async fn classify_frames(
        &self,
        frames: Vec<Vec<u8>>,
    ) -> Result<(Vec<LabelScore>, Vec<Vec<LabelScore>>)> {
        let mut per_frame = Vec::with_capacity(frames.len());
        for frame in frames {
            per_frame.push(self.classify_image(frame).await?);
        }
        let aggregated = soft_vote(&per_frame);
        Ok((aggregated, per_frame))
    }
}

fn decode_and_classify(backend: &dyn ClassifierBackend, bytes: &[u8]) -> Result<Vec<LabelScore>> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| anyhow!("failed to decode snapshot image: {e}"))?
        .to_rgb8();
    backend.classify_image(&image)
}

/// Sums per-label probability across frames, normalizes by frame count,
/// and returns the full label list sorted descending. The label with the
/// highest aggregated score is the argmax callers should promote; ties
/// are broken by the mean score among frames that voted for the label,
/// then by label text.
pub fn soft_vote(per_frame: &[Vec<LabelScore>]) -> Vec<LabelScore> {
    if per_frame.is_empty() {
        return Vec::new();
    }
    let total_frames = per_frame.len() as f64;

    let mut sums: HashMap<String, (f64, u32)> = HashMap::new();
    for frame in per_frame {
        for ls in frame {
            let entry = sums.entry(ls.label.clone()).or_insert((0.0, 0));
            entry.0 += ls.score;
            entry.1 += 1;
        }
    }

    let mut aggregated: Vec<(LabelScore, f64)> = sums
        .into_iter()
        .map(|(label, (sum, votes))| {
            let normalized = sum / total_frames;
            let mean_of_votes = if votes > 0 { sum / votes as f64 } else { 0.0 };
            (LabelScore { label, score: normalized }, mean_of_votes)
        })
        .collect();

    aggregated.sort_by(|(a, a_mean), (b, b_mean)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b_mean.partial_cmp(a_mean).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.label.cmp(&b.label))
    });

    aggregated.into_iter().map(|(ls, _)| ls).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ls(label: &str, score: f64) -> LabelScore {
        LabelScore {
            label: label.to_string(),
            score,
        }
    }

    #[test]
    fn soft_vote_picks_highest_aggregated_label() {
        let frames = vec![
            vec![ls("robin", 0.9), ls("jay", 0.1)],
            vec![ls("robin", 0.8), ls("jay", 0.2)],
        ];
        let aggregated = soft_vote(&frames);
        assert_eq!(aggregated[0].label, "robin");
    }

    #[test]
    fn soft_vote_breaks_ties_lexicographically() {
        let frames = vec![vec![ls("zebra_finch", 0.5), ls("avocet", 0.5)]];
        let aggregated = soft_vote(&frames);
        assert_eq!(aggregated[0].label, "avocet");
    }

    #[test]
    fn soft_vote_normalizes_by_total_frame_count() {
        let frames = vec![vec![ls("robin", 1.0)], vec![ls("robin", 1.0)], vec![ls("robin", 0.0)]];
        let aggregated = soft_vote(&frames);
        assert!((aggregated[0].score - (2.0 / 3.0)).abs() < 1e-9);
    }
}
