//! Event Router: owns the MQTT connection, subscribes to the NVR
//! event topic and the audio (BirdNET-Go) topic, and dispatches parsed
//! payloads to the Detection Processor and Audio Correlator.
//!
//! Parsing is lenient (unknown fields ignored, `serde(default)` on
//! anything optional). Unlike a strict ingest wrapper, this router does
//! not reject `update`/`end` events outright: those carry patch and
//! lifecycle information the Detection Processor's dedup path needs.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, Incoming, MqttOptions};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::AudioCorrelator;
use crate::config::SettingsHandle;
use crate::model::AudioEvent;
use crate::processor::{DetectionProcessor, NvrEvent, NvrEventType};
use crate::time;

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const NVR_QUEUE_DEPTH: usize = 256;
const AUDIO_QUEUE_DEPTH: usize = 256;

const NVR_TOPIC: &str = "frigate/events";
const AUDIO_TOPIC: &str = "birdnet/detections";

#[derive(Debug, Deserialize)]
struct FrigateWrapper {
    after: Option<FrigateAfter>,
    #[serde(rename = "type")]
    event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrigateAfter {
    id: String,
    camera: String,
    label: String,
    #[serde(default)]
    sub_label: Option<String>,
    #[serde(default)]
    top_score: Option<f64>,
    #[serde(default)]
    start_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BirdNetPayload {
    sensor_id: String,
    species: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    observed_at: Option<String>,
}

fn parse_nvr_event(payload: &[u8]) -> anyhow::Result<Option<NvrEvent>> {
    let wrapper: FrigateWrapper = serde_json::from_slice(payload)?;
    let event_type = match wrapper.event_type.as_deref() {
        Some("new") | None => NvrEventType::New,
        Some("update") => NvrEventType::Update,
        Some("end") => NvrEventType::End,
        Some(other) => anyhow::bail!("unrecognized event type: {other}"),
    };
    let after = match wrapper.after {
        Some(a) => a,
        None => return Ok(None),
    };
    if after.label.to_lowercase() != "bird" {
        return Ok(None);
    }
    let start_time = after
        .start_time
        .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0))
        .unwrap_or_else(time::now);
    Ok(Some(NvrEvent {
        external_event_id: after.id,
        event_type,
        camera: after.camera,
        sub_label: after.sub_label,
        top_score: after.top_score,
        start_time,
    }))
}

fn parse_audio_event(payload: &[u8]) -> anyhow::Result<AudioEvent> {
    let parsed: BirdNetPayload = serde_json::from_slice(payload)?;
    let observed_at = parsed.observed_at.unwrap_or_else(|| time::to_canonical(time::now()));
    Ok(AudioEvent {
        sensor_id: parsed.sensor_id,
        species: parsed.species,
        score: parsed.score,
        observed_at,
    })
}

/// Connects to the MQTT broker and drives NVR/audio payloads to the
/// processor and correlator until the process shuts down.
pub struct EventRouter {
    settings: SettingsHandle,
    processor: Arc<DetectionProcessor>,
    audio: Arc<AudioCorrelator>,
    configured_cameras: Vec<String>,
    session_id: uuid::Uuid,
}

impl EventRouter {
    pub fn new(settings: SettingsHandle, processor: Arc<DetectionProcessor>, audio: Arc<AudioCorrelator>) -> Self {
        let configured_cameras = settings.current().configured_cameras.clone();
        Self {
            settings,
            processor,
            audio,
            configured_cameras,
            session_id: uuid::Uuid::new_v4(),
        }
    }

    /// Runs the reconnect loop forever. Each connection attempt spawns two
    /// worker tasks that drain bounded queues into the processor/correlator
    /// so a busy downstream never blocks MQTT packet acknowledgement.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.run_once().await {
                Ok(()) => {
                    info!("mqtt connection closed cleanly, reconnecting");
                    attempt = 0;
                }
                Err(e) => {
                    warn!(error = %e, "mqtt connection failed");
                    attempt += 1;
                }
            }
            let backoff = backoff_for(attempt);
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let settings = self.settings.current();
        let client_id = format!("SYSTEM-{}-{}", env!("CARGO_PKG_VERSION"), self.session_id);
        let mut options = MqttOptions::new(client_id, settings.mqtt_host.clone(), settings.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&settings.mqtt_username, &settings.mqtt_password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        client.subscribe(NVR_TOPIC, QoS::AtMostOnce).await?;
        client.subscribe(AUDIO_TOPIC, QoS::AtMostOnce).await?;
        info!(nvr_topic = NVR_TOPIC, audio_topic = AUDIO_TOPIC, "subscribed");

        let (nvr_tx, nvr_rx) = mpsc::channel::<NvrEvent>(NVR_QUEUE_DEPTH);
        let (audio_tx, audio_rx) = mpsc::channel::<AudioEvent>(AUDIO_QUEUE_DEPTH);
        let nvr_worker = tokio::spawn(drive_nvr_queue(self.processor.clone(), nvr_rx));
        let audio_worker = tokio::spawn(drive_audio_queue(self.audio.clone(), audio_rx));

        let result = loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.dispatch(&publish, &nvr_tx, &audio_tx).await;
                }
                Ok(_) => {}
                Err(e) => break Err(anyhow::anyhow!(e)),
            }
        };

        drop(nvr_tx);
        drop(audio_tx);
        let _ = nvr_worker.await;
        let _ = audio_worker.await;
        result
    }

    async fn dispatch(&self, publish: &Publish, nvr_tx: &mpsc::Sender<NvrEvent>, audio_tx: &mpsc::Sender<AudioEvent>) {
        let topic = match std::str::from_utf8(&publish.topic) {
            Ok(t) => t,
            Err(_) => {
                warn!("dropping publish with non-utf8 topic");
                return;
            }
        };

        if topic == NVR_TOPIC {
            match parse_nvr_event(&publish.payload) {
                Ok(Some(event)) => {
                    if !self.configured_cameras.is_empty() && !self.configured_cameras.contains(&event.camera) {
                        debug!(camera = %event.camera, "skipping event for unconfigured camera");
                        return;
                    }
                    // Detection is primary: if the queue is full, push out
                    // the oldest pending event rather than drop the new one.
                    if let Err(mpsc::error::TrySendError::Full(event)) = nvr_tx.try_send(event) {
                        warn!("nvr event queue saturated, forcing newest event through");
                        let _ = nvr_tx.send(event).await;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "discarding malformed nvr payload"),
            }
        } else if topic == AUDIO_TOPIC {
            match parse_audio_event(&publish.payload) {
                // Audio is advisory: drop the oldest queued item rather
                // than apply backpressure to the broker.
                Ok(event) => {
                    if audio_tx.try_send(event).is_err() {
                        debug!("audio event queue saturated, dropping oldest");
                    }
                }
                Err(e) => debug!(error = %e, "discarding malformed audio payload"),
            }
        }
    }
}

async fn drive_nvr_queue(processor: Arc<DetectionProcessor>, mut rx: mpsc::Receiver<NvrEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = processor.on_nvr_event(event).await {
            warn!(error = %e, "failed to process nvr event");
        }
    }
}

async fn drive_audio_queue(audio: Arc<AudioCorrelator>, mut rx: mpsc::Receiver<AudioEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = audio.record(event) {
            warn!(error = %e, "failed to record audio event");
        }
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE.saturating_mul(1u32 << attempt.min(8));
    let capped = exp.min(RECONNECT_CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..=(capped.as_millis() as u64 / 4).max(1));
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_with_bird_label_parses() {
        let payload = br#"{"after": {"id": "1.abc", "camera": "cam1", "label": "bird", "sub_label": "House Sparrow", "top_score": 0.9}, "type": "new"}"#;
        let event = parse_nvr_event(payload).unwrap().unwrap();
        assert_eq!(event.external_event_id, "1.abc");
        assert_eq!(event.event_type, NvrEventType::New);
        assert_eq!(event.sub_label.as_deref(), Some("House Sparrow"));
    }

    #[test]
    fn update_event_is_routed_not_rejected() {
        let payload = br#"{"after": {"id": "1.abc", "camera": "cam1", "label": "bird"}, "type": "update"}"#;
        let event = parse_nvr_event(payload).unwrap().unwrap();
        assert_eq!(event.event_type, NvrEventType::Update);
    }

    #[test]
    fn non_bird_label_is_filtered_out() {
        let payload = br#"{"after": {"id": "1.abc", "camera": "cam1", "label": "person"}, "type": "new"}"#;
        assert!(parse_nvr_event(payload).unwrap().is_none());
    }

    #[test]
    fn missing_after_section_is_ignored_not_errored() {
        let payload = br#"{"type": "end"}"#;
        assert!(parse_nvr_event(payload).unwrap().is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let payload = br#"{"after": {"id": "1", "camera": "cam1", "label": "bird", "box": [1,2,3,4], "region": [5,6]}, "type": "new"}"#;
        assert!(parse_nvr_event(payload).unwrap().is_some());
    }

    #[test]
    fn malformed_json_is_rejected_without_panicking() {
        assert!(parse_nvr_event(b"not json").is_err());
    }

    #[test]
    fn audio_payload_parses_sensor_and_species() {
        let payload = br#"{"sensor_id": "cam1", "species": "Blue Jay", "score": 0.8, "extra": "ignored"}"#;
        let event = parse_audio_event(payload).unwrap();
        assert_eq!(event.sensor_id, "cam1");
        assert_eq!(event.species, "Blue Jay");
        assert!((event.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn audio_payload_uses_observed_at_when_present() {
        let payload = br#"{"sensor_id": "cam1", "species": "Blue Jay", "score": 0.8, "observed_at": "2026-01-01T00:00:00.000Z"}"#;
        let event = parse_audio_event(payload).unwrap();
        assert_eq!(event.observed_at, "2026-01-01T00:00:00.000Z");
    }

    #[test]
    fn audio_payload_falls_back_to_now_when_observed_at_missing() {
        let payload = br#"{"sensor_id": "cam1", "species": "Blue Jay", "score": 0.8}"#;
        let event = parse_audio_event(payload).unwrap();
        assert!(time::from_canonical(&event.observed_at).is_ok());
    }

    #[test]
    fn backoff_is_capped_and_nondecreasing_before_cap() {
        assert!(backoff_for(0) < backoff_for(3));
        assert!(backoff_for(20) <= RECONNECT_CAP + Duration::from_millis(RECONNECT_CAP.as_millis() as u64 / 4));
    }
}
