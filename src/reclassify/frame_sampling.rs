//! Deterministic frame-offset sampling for deep-video reclassification.
//!
//! Samples are drawn from a normal distribution centered on the clip
//! midpoint (a Box-Muller transform over a `ChaCha8Rng` seeded from the
//! event id, since `rand_chacha` is already the seeded-RNG idiom used
//! elsewhere for reproducible output) and deduplicated to a 100ms bucket
//! so "unique frame indices" means "unique points in time" rather than
//! requiring frame-accurate seeking into the source clip.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

const BUCKET_MS: i64 = 100;

/// Derives a stable seed from an event id so repeated reclassification
/// requests for the same event sample the same offsets.
pub fn seed_from_event_id(external_event_id: &str) -> u64 {
    let digest = Sha256::digest(external_event_id.as_bytes());
    u64::from_le_bytes(digest[0..8].try_into().expect("sha256 digest has at least 8 bytes"))
}

/// Returns up to `max_frames` unique, ascending offsets (in seconds)
/// into a clip of `clip_duration_secs`. Reproducible given the same
/// `(clip_duration_secs, max_frames, seed)`.
pub fn sample_offsets_secs(clip_duration_secs: f64, max_frames: usize, seed: u64) -> Vec<f64> {
    if clip_duration_secs <= 0.0 || max_frames == 0 {
        return Vec::new();
    }

    let mean = clip_duration_secs / 2.0;
    let std_dev = (clip_duration_secs / 6.0).max(0.05);
    let upper_bound = (clip_duration_secs - 0.001).max(0.0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut buckets = std::collections::BTreeSet::new();
    let max_attempts = max_frames.saturating_mul(50).max(50);

    for _ in 0..max_attempts {
        if buckets.len() >= max_frames {
            break;
        }
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        let offset = (mean + z * std_dev).clamp(0.0, upper_bound);
        let bucket = (offset * 1000.0 / BUCKET_MS as f64).round() as i64;
        buckets.insert(bucket);
    }

    buckets.into_iter().map(|b| (b as f64) * BUCKET_MS as f64 / 1000.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_produce_identical_offsets() {
        let a = sample_offsets_secs(12.0, 15, seed_from_event_id("1234567890.abc123"));
        let b = sample_offsets_secs(12.0, 15, seed_from_event_id("1234567890.abc123"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_event_ids_yield_different_seeds() {
        assert_ne!(seed_from_event_id("event-a"), seed_from_event_id("event-b"));
    }

    #[test]
    fn offsets_are_sorted_unique_and_within_bounds() {
        let offsets = sample_offsets_secs(20.0, 15, 42);
        assert!(!offsets.is_empty());
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert!(offsets.iter().all(|&o| (0.0..20.0).contains(&o)));
    }

    #[test]
    fn never_exceeds_max_frames() {
        let offsets = sample_offsets_secs(600.0, 15, 7);
        assert!(offsets.len() <= 15);
    }

    #[test]
    fn zero_duration_yields_no_offsets() {
        assert!(sample_offsets_secs(0.0, 15, 1).is_empty());
    }
}
