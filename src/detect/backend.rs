use anyhow::Result;
use image::RgbImage;

/// A single classification candidate, returned sorted descending by score.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// Snapshot returned by `ClassifierBackend::status`. No side effects.
#[derive(Clone, Debug, Default)]
pub struct ClassifierStatus {
    pub runtime: &'static str,
    pub loaded: bool,
    pub error: Option<String>,
}

/// Species classification backend.
///
/// Implementations must treat input images as read-only and must not
/// perform network I/O; they run on a bounded worker pool and are called
/// synchronously from there (see `detect::runtime::ClassifierRuntime`).
pub trait ClassifierBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Classify a single already-decoded image, sorted descending by score.
    fn classify_image(&self, image: &RgbImage) -> Result<Vec<LabelScore>>;

    fn status(&self) -> ClassifierStatus;
}
