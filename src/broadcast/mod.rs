//! Broadcaster: SSE fan-out with per-subscriber authorization and a
//! bounded ring buffer shared across subscribers.
//!
//! Built on `tokio::sync::broadcast`: each subscriber gets an independent
//! read cursor into one bounded ring, so a slow subscriber falls behind
//! and is told exactly how many events it missed (`Lagged`) rather than
//! blocking the producer or other subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::Settings;
use crate::model::Detection;

const DEFAULT_BUFFER: usize = 256;
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Connected,
    Detection(Detection),
    DetectionUpdated(Detection),
    ReclassificationStarted {
        external_event_id: String,
    },
    ReclassificationProgress {
        external_event_id: String,
        current_frame: usize,
        total_frames: usize,
        frame_index: usize,
        label: String,
        score: f64,
    },
    ReclassificationCompleted {
        external_event_id: String,
    },
    ReclassificationFailed {
        external_event_id: String,
        reason: String,
    },
    SettingsUpdated,
    Lag {
        dropped: u64,
    },
}

impl BroadcastEvent {
    fn camera(&self) -> Option<&str> {
        match self {
            BroadcastEvent::Detection(d) | BroadcastEvent::DetectionUpdated(d) => Some(&d.camera),
            _ => None,
        }
    }

    fn is_hidden(&self) -> bool {
        match self {
            BroadcastEvent::Detection(d) | BroadcastEvent::DetectionUpdated(d) => d.is_hidden,
            _ => false,
        }
    }
}

pub struct GuestFilter {
    pub allowed_cameras: Vec<String>,
}

pub struct Broadcaster {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self, guest_filter: Option<GuestFilter>) -> Subscription {
        Subscription {
            receiver: self.tx.subscribe(),
            guest_filter,
            delivered_connected: false,
        }
    }

    /// Publishes to every subscriber. Returns without error when there are
    /// no subscribers; that is not a failure of the pipeline step that
    /// triggered the broadcast.
    pub fn publish(&self, event: BroadcastEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<BroadcastEvent>,
    guest_filter: Option<GuestFilter>,
    delivered_connected: bool,
}

impl Subscription {
    /// Returns the next event this subscriber is authorized to see. A lag
    /// is surfaced as a synthetic `Lag` event rather than silently skipped.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        if !self.delivered_connected {
            self.delivered_connected = true;
            return Some(BroadcastEvent::Connected);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if authorized(&self.guest_filter, &event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return Some(BroadcastEvent::Lag { dropped: n }),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn authorized(guest_filter: &Option<GuestFilter>, event: &BroadcastEvent) -> bool {
    let Some(filter) = guest_filter else {
        return true;
    };
    if event.is_hidden() {
        return false;
    }
    match event.camera() {
        Some(camera) => filter.allowed_cameras.is_empty() || filter.allowed_cameras.iter().any(|c| c == camera),
        None => true,
    }
}

/// Builds the guest filter for an unauthenticated SSE connection from the
/// current settings snapshot, or `None` for an authenticated one.
pub fn guest_filter_for(settings: &Settings, authenticated: bool) -> Option<GuestFilter> {
    if authenticated {
        return None;
    }
    Some(GuestFilter {
        allowed_cameras: settings.guest_allowed_cameras.clone(),
    })
}
