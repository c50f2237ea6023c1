//! Letterbox resize and model-specific normalization.

use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};

/// Pixel value range a model expects. Detected from model metadata when
/// available; falls back to `ZeroToOne`, the more common convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Normalization {
    ZeroToOne,
    NegOneToOne,
}

impl Normalization {
    /// Inspects ONNX model metadata for a normalization hint. Models that
    /// don't carry one default to `ZeroToOne`.
    pub fn detect_from_metadata(meta: &std::collections::HashMap<String, String>) -> Self {
        match meta.get("normalization").map(String::as_str) {
            Some("neg_one_to_one") | Some("[-1,1]") => Normalization::NegOneToOne,
            _ => Normalization::ZeroToOne,
        }
    }

    fn apply(&self, value: f32) -> f32 {
        match self {
            Normalization::ZeroToOne => value / 255.0,
            Normalization::NegOneToOne => (value / 127.5) - 1.0,
        }
    }
}

/// Aspect-preserving resize onto a `target_w x target_h` canvas, padded
/// with mid-gray letterbox bars rather than stretched.
pub fn letterbox_resize(image: &DynamicImage, target_w: u32, target_h: u32) -> RgbImage {
    let (src_w, src_h) = (image.width() as f32, image.height() as f32);
    let scale = (target_w as f32 / src_w).min(target_h as f32 / src_h);
    let scaled_w = (src_w * scale).round().max(1.0) as u32;
    let scaled_h = (src_h * scale).round().max(1.0) as u32;

    let resized = image.resize_exact(scaled_w, scaled_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb([114, 114, 114]));

    let pad_x = (target_w - scaled_w) / 2;
    let pad_y = (target_h - scaled_h) / 2;
    image::imageops::overlay(&mut canvas, &resized.to_rgb8(), pad_x as i64, pad_y as i64);

    canvas
}

/// Converts a letterboxed RGB image into planar (CHW) `f32` input, scaled
/// per `norm`.
pub fn to_chw_tensor(image: &RgbImage, norm: Normalization) -> Vec<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut out = vec![0f32; 3 * width * height];
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for channel in 0..3 {
            out[channel * width * height + y * width + x] = norm.apply(pixel.0[channel] as f32);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    #[test]
    fn letterbox_preserves_aspect_ratio_with_padding() {
        let src = DynamicImage::ImageRgba8(RgbaImage::new(400, 100));
        let out = letterbox_resize(&src, 224, 224);
        assert_eq!(out.dimensions(), (224, 224));
        // Top row should be padding since the 4:1 source scales to a thin strip.
        assert_eq!(out.get_pixel(0, 0), &Rgb([114, 114, 114]));
    }

    #[test]
    fn zero_to_one_normalization_scales_into_unit_range() {
        let norm = Normalization::ZeroToOne;
        assert!((norm.apply(255.0) - 1.0).abs() < 1e-6);
        assert!((norm.apply(0.0) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn neg_one_to_one_normalization_centers_on_zero() {
        let norm = Normalization::NegOneToOne;
        assert!((norm.apply(127.5) - 0.0).abs() < 1e-3);
    }
}
