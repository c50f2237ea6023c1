//! Audio Correlator: per-sensor bounded ring of BirdNET-Go audio
//! detections matched against NVR detections by time window.
//! Inserts are O(1) amortized; `match_event` is O(log n) via a
//! `BTreeMap` keyed on the canonical timestamp string so lexicographic
//! range queries line up with chronological ones (see `crate::time`).

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::Result;
use chrono::Duration;

use crate::model::AudioEvent;
use crate::storage::EventStore;
use crate::time;

pub struct AudioCorrelator {
    store: std::sync::Arc<dyn EventStore>,
    buffer_hours: u32,
    rings: RwLock<HashMap<String, BTreeMap<String, AudioEvent>>>,
}

impl AudioCorrelator {
    pub fn new(store: std::sync::Arc<dyn EventStore>, buffer_hours: u32) -> Self {
        Self {
            store,
            buffer_hours,
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Appends an incoming audio event to the durable projection and the
    /// in-memory ring, evicting entries older than `audio_buffer_hours`.
    pub fn record(&self, event: AudioEvent) -> Result<()> {
        self.store.append_audio_event(&event)?;

        let mut rings = self.rings.write().expect("audio ring lock poisoned");
        let ring = rings.entry(event.sensor_id.clone()).or_default();
        ring.insert(event.observed_at.clone(), event);
        self.evict_stale(ring);
        Ok(())
    }

    fn evict_stale(&self, ring: &mut BTreeMap<String, AudioEvent>) {
        let cutoff = time::to_canonical(time::now() - Duration::hours(self.buffer_hours as i64));
        let stale: Vec<String> = ring.range(..cutoff).map(|(k, _)| k.clone()).collect();
        for key in stale {
            ring.remove(&key);
        }
    }

    /// Lazily reconstructs a sensor's ring from the durable projection on
    /// first access, so a process restart or DB reset still has audio
    /// context for new detections.
    fn hydrate(&self, sensor_id: &str) -> Result<BTreeMap<String, AudioEvent>> {
        let since = time::to_canonical(time::now() - Duration::hours(self.buffer_hours as i64));
        let events = self.store.recent_audio_events(sensor_id, &since)?;
        Ok(events.into_iter().map(|e| (e.observed_at.clone(), e)).collect())
    }

    /// `match(sensor_id, t, window)`: returns the audio event with max
    /// score whose `|observed_at - t| <= window`, or `None`.
    pub fn match_event(&self, sensor_id: &str, t: &str, window_secs: u32) -> Result<Option<AudioEvent>> {
        {
            let rings = self.rings.read().expect("audio ring lock poisoned");
            if !rings.contains_key(sensor_id) {
                drop(rings);
                let hydrated = self.hydrate(sensor_id)?;
                let mut rings = self.rings.write().expect("audio ring lock poisoned");
                rings.entry(sensor_id.to_string()).or_insert(hydrated);
            }
        }

        let center = time::from_canonical(t)?;
        let lower = time::to_canonical(center - Duration::seconds(window_secs as i64));
        let upper = time::to_canonical(center + Duration::seconds(window_secs as i64));

        let rings = self.rings.read().expect("audio ring lock poisoned");
        let ring = match rings.get(sensor_id) {
            Some(r) => r,
            None => return Ok(None),
        };

        let best = ring
            .range(lower..=upper)
            .map(|(_, event)| event)
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteEventStore;

    fn event(sensor: &str, t: chrono::DateTime<chrono::Utc>, species: &str, score: f64) -> AudioEvent {
        AudioEvent {
            sensor_id: sensor.to_string(),
            species: species.to_string(),
            score,
            observed_at: time::to_canonical(t),
        }
    }

    #[test]
    fn matches_within_window_picks_highest_score() {
        let store = std::sync::Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let correlator = AudioCorrelator::new(store, 6);
        let base = time::now();

        correlator.record(event("cam1-mic", base, "House Sparrow", 0.6)).unwrap();
        correlator
            .record(event("cam1-mic", base + Duration::seconds(10), "House Sparrow", 0.9))
            .unwrap();

        let at = time::to_canonical(base + Duration::seconds(5));
        let result = correlator.match_event("cam1-mic", &at, 300).unwrap().unwrap();
        assert_eq!(result.species, "House Sparrow");
        assert!((result.score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn outside_window_returns_none() {
        let store = std::sync::Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let correlator = AudioCorrelator::new(store, 6);
        let base = time::now();

        correlator.record(event("cam1-mic", base, "House Sparrow", 0.9)).unwrap();

        let at = time::to_canonical(base + Duration::seconds(600));
        let result = correlator.match_event("cam1-mic", &at, 60).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn restart_rehydrates_from_durable_projection() {
        let store = std::sync::Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let base = time::now();
        store.append_audio_event(&event("cam1-mic", base, "Blue Jay", 0.75)).unwrap();

        let correlator = AudioCorrelator::new(store, 6);
        let at = time::to_canonical(base + Duration::seconds(1));
        let result = correlator.match_event("cam1-mic", &at, 300).unwrap().unwrap();
        assert_eq!(result.species, "Blue Jay");
    }
}
