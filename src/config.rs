//! Layered configuration: environment overrides a persisted
//! `config/config.json`, which overrides built-in defaults.
//!
//! Settings are published as an immutable snapshot: readers clone the
//! `Arc<Settings>` once per call via [`SettingsHandle::current`], and
//! [`SettingsHandle::publish`] swaps in a new snapshot atomically, since
//! settings changes need to broadcast to subscribers rather than only
//! take effect on the next process restart.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DB_PATH: &str = "data/store.db";
const DEFAULT_MEDIA_CACHE_DIR: &str = "data/media-cache";
const DEFAULT_MODEL_PATH: &str = "data/models/classifier.onnx";
const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_AUDIO_BUFFER_HOURS: u32 = 6;
const DEFAULT_AUDIO_CORRELATION_WINDOW_SECS: i64 = 300;
const DEFAULT_CLASSIFICATION_THRESHOLD: f64 = 0.7;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.4;
const DEFAULT_AUDIO_CONFIRM_SCORE: f64 = 0.5;
const DEFAULT_PUBLIC_HISTORY_HOURS: u32 = 24;
const DEFAULT_MAX_RECLASSIFY_FRAMES: usize = 15;
const DEFAULT_MODEL_LABELS_PATH: &str = "data/models/labels.txt";
const DEFAULT_MODEL_INPUT_SIZE: u32 = 224;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct SettingsFile {
    frigate_url: Option<String>,
    frigate_auth_token: Option<String>,
    api_auth_token: Option<String>,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    api_addr: Option<String>,
    db_path: Option<String>,
    media_cache_dir: Option<String>,
    model_path: Option<String>,
    retention_days: Option<u32>,
    audio_buffer_hours: Option<u32>,
    audio_correlation_window_secs: Option<i64>,
    classification_threshold: Option<f64>,
    min_confidence: Option<f64>,
    audio_confirm_score: Option<f64>,
    trust_frigate_sublabel: Option<bool>,
    fast_path_fallback_enabled: Option<bool>,
    clips_enabled: Option<bool>,
    public_history_hours: Option<u32>,
    guest_allowed_cameras: Option<Vec<String>>,
    configured_cameras: Option<Vec<String>>,
    blocked_labels: Option<Vec<String>>,
    max_reclassify_frames: Option<usize>,
    trusted_proxies: Option<Vec<String>>,
    weather_base_url: Option<String>,
    taxonomy_base_url: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    model_labels_path: Option<String>,
    model_input_size: Option<u32>,
}

/// Process-wide settings snapshot. Cheap to clone (wrapped in `Arc` by
/// [`SettingsHandle`]); never mutated in place.
#[derive(Debug, Clone)]
pub struct Settings {
    pub frigate_url: String,
    pub frigate_auth_token: Option<String>,
    /// Shared secret for the public HTTP API's bearer token. A caller
    /// presenting a matching token is authenticated; anyone else (and
    /// everyone, when this is unset) is a guest.
    pub api_auth_token: Option<String>,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub api_addr: String,
    pub db_path: String,
    pub media_cache_dir: PathBuf,
    pub model_path: PathBuf,
    pub retention_days: u32,
    pub audio_buffer_hours: u32,
    pub audio_correlation_window_secs: i64,
    pub classification_threshold: f64,
    pub min_confidence: f64,
    pub audio_confirm_score: f64,
    pub trust_frigate_sublabel: bool,
    pub fast_path_fallback_enabled: bool,
    pub clips_enabled: bool,
    pub public_history_hours: u32,
    pub guest_allowed_cameras: Vec<String>,
    pub configured_cameras: Vec<String>,
    pub blocked_labels: Vec<String>,
    pub max_reclassify_frames: usize,
    pub trusted_proxies: Vec<String>,
    /// Open-Meteo-compatible base URL; `None` disables weather enrichment.
    pub weather_base_url: Option<String>,
    /// GBIF-compatible taxonomy lookup base URL; `None` disables taxonomy enrichment.
    pub taxonomy_base_url: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub model_labels_path: PathBuf,
    pub model_input_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frigate_url: "http://127.0.0.1:5000".to_string(),
            frigate_auth_token: None,
            api_auth_token: None,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            api_addr: DEFAULT_API_ADDR.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            media_cache_dir: PathBuf::from(DEFAULT_MEDIA_CACHE_DIR),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            retention_days: DEFAULT_RETENTION_DAYS,
            audio_buffer_hours: DEFAULT_AUDIO_BUFFER_HOURS,
            audio_correlation_window_secs: DEFAULT_AUDIO_CORRELATION_WINDOW_SECS,
            classification_threshold: DEFAULT_CLASSIFICATION_THRESHOLD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            audio_confirm_score: DEFAULT_AUDIO_CONFIRM_SCORE,
            trust_frigate_sublabel: true,
            fast_path_fallback_enabled: true,
            clips_enabled: true,
            public_history_hours: DEFAULT_PUBLIC_HISTORY_HOURS,
            guest_allowed_cameras: Vec::new(),
            configured_cameras: Vec::new(),
            blocked_labels: Vec::new(),
            max_reclassify_frames: DEFAULT_MAX_RECLASSIFY_FRAMES,
            trusted_proxies: Vec::new(),
            weather_base_url: None,
            taxonomy_base_url: None,
            latitude: 0.0,
            longitude: 0.0,
            model_labels_path: PathBuf::from(DEFAULT_MODEL_LABELS_PATH),
            model_input_size: DEFAULT_MODEL_INPUT_SIZE,
        }
    }
}

/// Secret-bearing fields are redacted before the settings are ever
/// serialized back out (e.g. to an API response): a blank or placeholder
/// value on a patch means "keep existing", never "clear it".
const SECRET_PLACEHOLDER: &str = "••••••••";

impl Settings {
    fn from_file(file: SettingsFile, defaults: &Settings) -> Self {
        Self {
            frigate_url: file.frigate_url.unwrap_or_else(|| defaults.frigate_url.clone()),
            frigate_auth_token: file.frigate_auth_token.or_else(|| defaults.frigate_auth_token.clone()),
            api_auth_token: file.api_auth_token.or_else(|| defaults.api_auth_token.clone()),
            mqtt_host: file.mqtt_host.unwrap_or_else(|| defaults.mqtt_host.clone()),
            mqtt_port: file.mqtt_port.unwrap_or(defaults.mqtt_port),
            mqtt_username: file.mqtt_username.or_else(|| defaults.mqtt_username.clone()),
            mqtt_password: file.mqtt_password.or_else(|| defaults.mqtt_password.clone()),
            api_addr: file.api_addr.unwrap_or_else(|| defaults.api_addr.clone()),
            db_path: file.db_path.unwrap_or_else(|| defaults.db_path.clone()),
            media_cache_dir: file
                .media_cache_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.media_cache_dir.clone()),
            model_path: file
                .model_path
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.model_path.clone()),
            retention_days: file.retention_days.unwrap_or(defaults.retention_days),
            audio_buffer_hours: file.audio_buffer_hours.unwrap_or(defaults.audio_buffer_hours),
            audio_correlation_window_secs: file
                .audio_correlation_window_secs
                .unwrap_or(defaults.audio_correlation_window_secs),
            classification_threshold: file
                .classification_threshold
                .unwrap_or(defaults.classification_threshold),
            min_confidence: file.min_confidence.unwrap_or(defaults.min_confidence),
            audio_confirm_score: file.audio_confirm_score.unwrap_or(defaults.audio_confirm_score),
            trust_frigate_sublabel: file
                .trust_frigate_sublabel
                .unwrap_or(defaults.trust_frigate_sublabel),
            fast_path_fallback_enabled: file
                .fast_path_fallback_enabled
                .unwrap_or(defaults.fast_path_fallback_enabled),
            clips_enabled: file.clips_enabled.unwrap_or(defaults.clips_enabled),
            public_history_hours: file
                .public_history_hours
                .unwrap_or(defaults.public_history_hours),
            guest_allowed_cameras: file
                .guest_allowed_cameras
                .unwrap_or_else(|| defaults.guest_allowed_cameras.clone()),
            configured_cameras: file
                .configured_cameras
                .unwrap_or_else(|| defaults.configured_cameras.clone()),
            blocked_labels: file.blocked_labels.unwrap_or_else(|| defaults.blocked_labels.clone()),
            max_reclassify_frames: file
                .max_reclassify_frames
                .unwrap_or(defaults.max_reclassify_frames),
            trusted_proxies: file.trusted_proxies.unwrap_or_else(|| defaults.trusted_proxies.clone()),
            weather_base_url: file.weather_base_url.or_else(|| defaults.weather_base_url.clone()),
            taxonomy_base_url: file.taxonomy_base_url.or_else(|| defaults.taxonomy_base_url.clone()),
            latitude: file.latitude.unwrap_or(defaults.latitude),
            longitude: file.longitude.unwrap_or(defaults.longitude),
            model_labels_path: file
                .model_labels_path
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.model_labels_path.clone()),
            model_input_size: file.model_input_size.unwrap_or(defaults.model_input_size),
        }
    }

    fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("FRIGATE_URL") {
            self.frigate_url = v;
        }
        if let Ok(v) = std::env::var("FRIGATE_AUTH_TOKEN") {
            if !v.is_empty() {
                self.frigate_auth_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("API_AUTH_TOKEN") {
            if !v.is_empty() {
                self.api_auth_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("MQTT_HOST") {
            self.mqtt_host = v;
        }
        if let Ok(v) = std::env::var("MQTT_PORT") {
            if let Ok(port) = v.parse() {
                self.mqtt_port = port;
            }
        }
        if let Ok(v) = std::env::var("MQTT_USERNAME") {
            self.mqtt_username = Some(v);
        }
        if let Ok(v) = std::env::var("MQTT_PASSWORD") {
            if !v.is_empty() {
                self.mqtt_password = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RETENTION_DAYS") {
            if let Ok(days) = v.parse() {
                self.retention_days = days;
            }
        }
        if let Ok(v) = std::env::var("WEATHER_BASE_URL") {
            self.weather_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("TAXONOMY_BASE_URL") {
            self.taxonomy_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("LATITUDE") {
            if let Ok(lat) = v.parse() {
                self.latitude = lat;
            }
        }
        if let Ok(v) = std::env::var("LONGITUDE") {
            if let Ok(lon) = v.parse() {
                self.longitude = lon;
            }
        }
        self
    }

    /// Returns a copy with secrets masked, safe to serialize back to a
    /// client. Never used for the on-disk write path.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(SettingsFile {
            frigate_url: Some(self.frigate_url.clone()),
            frigate_auth_token: self.frigate_auth_token.as_ref().map(|_| SECRET_PLACEHOLDER.to_string()),
            api_auth_token: self.api_auth_token.as_ref().map(|_| SECRET_PLACEHOLDER.to_string()),
            mqtt_host: Some(self.mqtt_host.clone()),
            mqtt_port: Some(self.mqtt_port),
            mqtt_username: self.mqtt_username.clone(),
            mqtt_password: self.mqtt_password.as_ref().map(|_| SECRET_PLACEHOLDER.to_string()),
            api_addr: Some(self.api_addr.clone()),
            db_path: Some(self.db_path.clone()),
            media_cache_dir: Some(self.media_cache_dir.display().to_string()),
            model_path: Some(self.model_path.display().to_string()),
            retention_days: Some(self.retention_days),
            audio_buffer_hours: Some(self.audio_buffer_hours),
            audio_correlation_window_secs: Some(self.audio_correlation_window_secs),
            classification_threshold: Some(self.classification_threshold),
            min_confidence: Some(self.min_confidence),
            audio_confirm_score: Some(self.audio_confirm_score),
            trust_frigate_sublabel: Some(self.trust_frigate_sublabel),
            fast_path_fallback_enabled: Some(self.fast_path_fallback_enabled),
            clips_enabled: Some(self.clips_enabled),
            public_history_hours: Some(self.public_history_hours),
            guest_allowed_cameras: Some(self.guest_allowed_cameras.clone()),
            configured_cameras: Some(self.configured_cameras.clone()),
            blocked_labels: Some(self.blocked_labels.clone()),
            max_reclassify_frames: Some(self.max_reclassify_frames),
            trusted_proxies: Some(self.trusted_proxies.clone()),
            weather_base_url: self.weather_base_url.clone(),
            taxonomy_base_url: self.taxonomy_base_url.clone(),
            latitude: Some(self.latitude),
            longitude: Some(self.longitude),
            model_labels_path: Some(self.model_labels_path.display().to_string()),
            model_input_size: Some(self.model_input_size),
        })
        .expect("Settings always serializes");
        if let Some(obj) = value.as_object_mut() {
            obj.retain(|_, v| !v.is_null());
        }
        value
    }

    /// Merge a patch coming from a settings-update request. A blank or
    /// placeholder secret value means "keep existing", never "clear it" —
    /// an empty *non-secret* required field is an invalid-input error
    /// left to the caller to enforce before calling this.
    pub fn merged_with_patch(&self, patch: serde_json::Value) -> Result<Settings> {
        let mut file: SettingsFile = serde_json::from_value(patch).context("invalid settings patch")?;
        if matches!(file.frigate_auth_token.as_deref(), Some("") | Some(SECRET_PLACEHOLDER)) {
            file.frigate_auth_token = None;
        }
        if matches!(file.api_auth_token.as_deref(), Some("") | Some(SECRET_PLACEHOLDER)) {
            file.api_auth_token = None;
        }
        if matches!(file.mqtt_password.as_deref(), Some("") | Some(SECRET_PLACEHOLDER)) {
            file.mqtt_password = None;
        }
        Ok(Settings::from_file(file, self))
    }
}

/// Load settings from `config/config.json` (if present) layered under
/// defaults, then apply environment overrides. Precedence: env >
/// persisted config > defaults.
pub fn load(config_path: &Path) -> Result<Settings> {
    let defaults = Settings::default();
    let settings = if config_path.exists() {
        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let file: SettingsFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        Settings::from_file(file, &defaults)
    } else {
        defaults
    };
    Ok(settings.apply_env())
}

/// Persist settings to disk, preserving whatever secret was already on
/// disk when the in-memory value has been redacted or left blank.
pub fn save(config_path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let existing_secrets = if config_path.exists() {
        let raw = std::fs::read_to_string(config_path).unwrap_or_default();
        serde_json::from_str::<SettingsFile>(&raw).ok()
    } else {
        None
    };

    let mut file = SettingsFile {
        frigate_url: Some(settings.frigate_url.clone()),
        frigate_auth_token: settings.frigate_auth_token.clone(),
        api_auth_token: settings.api_auth_token.clone(),
        mqtt_host: Some(settings.mqtt_host.clone()),
        mqtt_port: Some(settings.mqtt_port),
        mqtt_username: settings.mqtt_username.clone(),
        mqtt_password: settings.mqtt_password.clone(),
        api_addr: Some(settings.api_addr.clone()),
        db_path: Some(settings.db_path.clone()),
        media_cache_dir: Some(settings.media_cache_dir.display().to_string()),
        model_path: Some(settings.model_path.display().to_string()),
        retention_days: Some(settings.retention_days),
        audio_buffer_hours: Some(settings.audio_buffer_hours),
        audio_correlation_window_secs: Some(settings.audio_correlation_window_secs),
        classification_threshold: Some(settings.classification_threshold),
        min_confidence: Some(settings.min_confidence),
        audio_confirm_score: Some(settings.audio_confirm_score),
        trust_frigate_sublabel: Some(settings.trust_frigate_sublabel),
        fast_path_fallback_enabled: Some(settings.fast_path_fallback_enabled),
        clips_enabled: Some(settings.clips_enabled),
        public_history_hours: Some(settings.public_history_hours),
        guest_allowed_cameras: Some(settings.guest_allowed_cameras.clone()),
        configured_cameras: Some(settings.configured_cameras.clone()),
        blocked_labels: Some(settings.blocked_labels.clone()),
        max_reclassify_frames: Some(settings.max_reclassify_frames),
        trusted_proxies: Some(settings.trusted_proxies.clone()),
        weather_base_url: settings.weather_base_url.clone(),
        taxonomy_base_url: settings.taxonomy_base_url.clone(),
        latitude: Some(settings.latitude),
        longitude: Some(settings.longitude),
        model_labels_path: Some(settings.model_labels_path.display().to_string()),
        model_input_size: Some(settings.model_input_size),
    };

    // Never clobber a previously-saved secret with nothing.
    if file.frigate_auth_token.is_none() {
        if let Some(prev) = existing_secrets.as_ref().and_then(|f| f.frigate_auth_token.clone()) {
            file.frigate_auth_token = Some(prev);
        }
    }
    if file.mqtt_password.is_none() {
        if let Some(prev) = existing_secrets.as_ref().and_then(|f| f.mqtt_password.clone()) {
            file.mqtt_password = Some(prev);
        }
    }
    if file.api_auth_token.is_none() {
        if let Some(prev) = existing_secrets.as_ref().and_then(|f| f.api_auth_token.clone()) {
            file.api_auth_token = Some(prev);
        }
    }

    let serialized = serde_json::to_string_pretty(&file)?;
    std::fs::write(config_path, serialized)?;
    Ok(())
}

/// A process-wide, atomically-swappable settings snapshot.
///
/// Readers call [`current`](Self::current) once per request/call and use
/// that snapshot for the rest of their work, so a concurrent publish
/// never produces a torn read. Updates publish a new `Arc` and the caller
/// is responsible for emitting a `settings_updated` broadcast event.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(initial: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    pub fn publish(&self, new_settings: Settings) {
        *self.inner.write().expect("settings lock poisoned") = Arc::new(new_settings);
    }
}
