use crate::detect::backend::{ClassifierBackend, ClassifierStatus, LabelScore};
use anyhow::Result;
use image::RgbImage;
use sha2::{Digest, Sha256};

/// Deterministic backend for tests: hashes pixel bytes to pick a label
/// from a fixed set, so the same image always classifies the same way
/// without loading a real model.
pub struct StubBackend {
    labels: Vec<String>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            labels: vec![
                "American Robin".to_string(),
                "House Sparrow".to_string(),
                "Blue Jay".to_string(),
                "Northern Cardinal".to_string(),
                "Unknown Bird".to_string(),
            ],
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify_image(&self, image: &RgbImage) -> Result<Vec<LabelScore>> {
        let digest = Sha256::digest(image.as_raw());
        let primary = (digest[0] as usize) % self.labels.len();

        let mut scores: Vec<LabelScore> = self
            .labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let score = if i == primary {
                    0.8 + (digest[1] as f64 / 255.0) * 0.2
                } else {
                    (digest[(i + 2) % digest.len()] as f64 / 255.0) * 0.3
                };
                LabelScore {
                    label: label.clone(),
                    score,
                }
            })
            .collect();

        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        Ok(scores)
    }

    fn status(&self) -> ClassifierStatus {
        ClassifierStatus {
            runtime: "stub",
            loaded: true,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_image_classifies_identically() {
        let backend = StubBackend::new();
        let image = RgbImage::from_pixel(8, 8, image::Rgb([12, 200, 40]));
        let a = backend.classify_image(&image).unwrap();
        let b = backend.classify_image(&image).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn results_are_sorted_descending() {
        let backend = StubBackend::new();
        let image = RgbImage::from_pixel(8, 8, image::Rgb([7, 99, 201]));
        let scores = backend.classify_image(&image).unwrap();
        for pair in scores.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
