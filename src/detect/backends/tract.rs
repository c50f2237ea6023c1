use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::{ClassifierBackend, ClassifierStatus, LabelScore};
use crate::detect::preprocess::{letterbox_resize, to_chw_tensor, Normalization};

/// ONNX-backed species classifier, built on `tract_onnx` model loading
/// generalized to a single-image classification head: one
/// `(1, num_classes)` score tensor rather than boxes/scores/classes
/// triples.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    normalization: Normalization,
    labels: Vec<String>,
}

impl TractBackend {
    pub fn load(
        model_path: &Path,
        labels_path: &Path,
        width: u32,
        height: u32,
        normalization: Normalization,
    ) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, height as usize, width as usize)),
            )
            .context("failed to set classifier input fact")?
            .into_optimized()
            .context("failed to optimize classifier model")?
            .into_runnable()
            .context("failed to build runnable classifier model")?;

        let labels = load_labels(labels_path)?;

        Ok(Self {
            model,
            width,
            height,
            normalization,
            labels,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Result<Tensor> {
        let data = to_chw_tensor(image, self.normalization);
        let array = tract_ndarray::Array4::from_shape_vec(
            (1, 3, self.height as usize, self.width as usize),
            data,
        )
        .context("classifier input tensor shape mismatch")?;
        Ok(array.into_tensor())
    }

    fn extract_scores(output: &Tensor) -> Result<Vec<f32>> {
        let shape = output.shape();
        let view = output
            .to_array_view::<f32>()
            .context("classifier output tensor was not f32")?;
        let data = view
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("classifier output tensor is not contiguous"))?;
        let len = match shape {
            [1, n] => *n,
            [n] => *n,
            _ => return Err(anyhow::anyhow!("classifier output must have shape [N] or [1,N], got {:?}", shape)),
        };
        if data.len() != len {
            return Err(anyhow::anyhow!(
                "classifier output has {} values, expected {}",
                data.len(),
                len
            ));
        }
        Ok(data.to_vec())
    }
}

fn load_labels(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open labels file {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let mut labels = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            labels.push(trimmed.to_string());
        }
    }
    if labels.is_empty() {
        anyhow::bail!("labels file {} contained no labels", path.display());
    }
    Ok(labels)
}

fn softmax(scores: &[f32]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f32::MIN, f32::max);
    let exps: Vec<f64> = scores.iter().map(|v| ((v - max) as f64).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; scores.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

impl ClassifierBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn classify_image(&self, image: &RgbImage) -> Result<Vec<LabelScore>> {
        let dynamic = DynamicImage::ImageRgb8(image.clone());
        let resized = letterbox_resize(&dynamic, self.width, self.height);
        let input = self.build_input(&resized)?;
        let outputs = self.model.run(tvec!(input.into())).context("classifier inference failed")?;
        let raw = Self::extract_scores(&outputs[0])?;
        if raw.len() != self.labels.len() {
            anyhow::bail!(
                "classifier produced {} scores but {} labels are loaded",
                raw.len(),
                self.labels.len()
            );
        }
        let probabilities = softmax(&raw);

        let mut scores: Vec<LabelScore> = self
            .labels
            .iter()
            .cloned()
            .zip(probabilities)
            .map(|(label, score)| LabelScore { label, score })
            .collect();
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scores)
    }

    fn status(&self) -> ClassifierStatus {
        ClassifierStatus {
            runtime: "tract",
            loaded: true,
            error: None,
        }
    }
}
