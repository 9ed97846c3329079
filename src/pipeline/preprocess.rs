//! Image → classifier input tensor.
//!
//! **Services architecture**: the `Preprocessor` trait is the stage interface;
//! `StandardPreprocessor` composes validation, range rescaling, channel
//! reconciliation, optional contrast enhancement, resize and input scaling.
//!
//! Key rules:
//! - Deterministic: no augmentation, no randomness, fixed iteration order
//! - Never mutates the source image; the produced tensor is owned by the caller
//! - Malformed images fail with `InvalidImage`, never with a default tensor

use image::{GrayImage, Luma};
use ndarray::{Array2, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::enhance::ContrastEnhancer;
use super::resample::resize_bilinear;
use super::xray::{luma, XrayImage};
use super::AnalysisError;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Smallest accepted edge length of a raw image.
pub const MIN_IMAGE_DIMENSION: u32 = 8;

// ═══════════════════════════════════════════════════════════
// Configuration types
// ═══════════════════════════════════════════════════════════

/// Numeric range the classifier was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputScale {
    /// Pixel intensities in [0, 1] (`x / 255` for 8-bit sources).
    #[default]
    UnitInterval,
    /// Per-channel `(x - mean) / std` applied after unit scaling.
    Standardized { mean: Vec<f32>, std: Vec<f32> },
}

/// What the classifier needs. Changes per model, not per image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    #[serde(default)]
    pub scale: InputScale,
}

impl InputSpec {
    /// 224x224 RGB in [0, 1], the resolution chest X-ray CNNs are usually
    /// trained at.
    pub fn chest_xray() -> Self {
        Self {
            height: 224,
            width: 224,
            channels: 3,
            scale: InputScale::UnitInterval,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.height == 0 || self.width == 0 {
            return Err(format!(
                "input resolution must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(format!("input channels must be 1 or 3, got {}", self.channels));
        }
        if let InputScale::Standardized { mean, std } = &self.scale {
            if mean.len() != self.channels || std.len() != self.channels {
                return Err("standardization needs one mean/std per channel".into());
            }
            if mean.iter().chain(std.iter()).any(|v| !v.is_finite())
                || std.iter().any(|&s| s <= 0.0)
            {
                return Err("standardization mean/std must be finite with std > 0".into());
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Tensor
// ═══════════════════════════════════════════════════════════

/// Classifier input in `(channels, height, width)` layout. Read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor(Array3<f32>);

impl InputTensor {
    pub fn new(data: Array3<f32>) -> Self {
        Self(data)
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }

    /// `(channels, height, width)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.0.dim()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.0
    }
}

// ═══════════════════════════════════════════════════════════
// Preprocessor trait
// ═══════════════════════════════════════════════════════════

pub trait Preprocessor: Send + Sync {
    /// Normalize a raw image into the classifier's input tensor.
    fn prepare(&self, image: &XrayImage) -> Result<InputTensor, AnalysisError>;
}

/// Production preprocessor.
///
/// Pipeline flow:
/// 1. Validate the image (dims, channel count, finite samples, value range)
/// 2. Rescale samples to [0, 1] using the declared range
/// 3. Optional contrast enhancement (gray domain)
/// 4. Reconcile channels (replicate gray / collapse RGB to luma)
/// 5. Bilinear resize to the model resolution
/// 6. Apply the model's input scale
#[derive(Debug, Clone)]
pub struct StandardPreprocessor {
    spec: InputSpec,
    enhancer: Option<ContrastEnhancer>,
}

impl StandardPreprocessor {
    pub fn new(spec: InputSpec) -> Self {
        Self {
            spec,
            enhancer: None,
        }
    }

    /// Add contrast enhancement before resizing.
    pub fn with_contrast_enhancement(mut self, enhancer: ContrastEnhancer) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn spec(&self) -> &InputSpec {
        &self.spec
    }
}

impl Preprocessor for StandardPreprocessor {
    fn prepare(&self, image: &XrayImage) -> Result<InputTensor, AnalysisError> {
        // 1. Validate
        validate_image(image)?;
        self.spec
            .validate()
            .map_err(|e| AnalysisError::ModelUnavailable(format!("model input contract: {e}")))?;

        // 2. Rescale to unit planes
        let mut planes = unit_planes(image);

        // 3. Contrast enhancement (gray domain)
        if let Some(ref enhancer) = self.enhancer {
            planes = vec![enhance_plane(enhancer, &collapse_to_luma(planes))];
        }

        // 4. Channel reconciliation
        let planes = reconcile_channels(planes, self.spec.channels);

        // 5 + 6. Resize and scale into the tensor
        let (h, w) = (self.spec.height, self.spec.width);
        let mut tensor = Array3::<f32>::zeros((self.spec.channels, h, w));
        for (c, plane) in planes.iter().enumerate() {
            let mut resized = resize_bilinear(plane.view(), h, w);
            if let InputScale::Standardized { mean, std } = &self.spec.scale {
                let (m, s) = (mean[c], std[c]);
                resized.mapv_inplace(|v| (v - m) / s);
            }
            tensor.index_axis_mut(Axis(0), c).assign(&resized);
        }

        debug!(
            original = format!("{}x{}x{}", image.width(), image.height(), image.channels()),
            output = format!("{}x{}x{}", w, h, self.spec.channels),
            enhanced = self.enhancer.is_some(),
            "Image prepared for classifier"
        );

        Ok(InputTensor::new(tensor))
    }
}

// ═══════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════

/// Structural and numeric validation of a raw image.
pub fn validate_image(image: &XrayImage) -> Result<(), AnalysisError> {
    if image.width() == 0 || image.height() == 0 || image.is_empty() {
        return Err(AnalysisError::InvalidImage(format!(
            "image has zero area ({}x{})",
            image.width(),
            image.height()
        )));
    }
    if image.channels() != 1 && image.channels() != 3 {
        return Err(AnalysisError::InvalidImage(format!(
            "unsupported channel count {}, expected 1 or 3",
            image.channels()
        )));
    }
    if image.width() < MIN_IMAGE_DIMENSION || image.height() < MIN_IMAGE_DIMENSION {
        return Err(AnalysisError::InvalidImage(format!(
            "image {}x{} is below the {MIN_IMAGE_DIMENSION}px minimum",
            image.width(),
            image.height()
        )));
    }
    if !image.range().is_valid() {
        return Err(AnalysisError::InvalidImage(format!(
            "degenerate value range [{}, {}]",
            image.range().min,
            image.range().max
        )));
    }
    if let Some(idx) = image.samples().iter().position(|v| !v.is_finite()) {
        return Err(AnalysisError::InvalidImage(format!(
            "non-finite sample at index {idx}"
        )));
    }
    Ok(())
}

/// Split interleaved samples into per-channel planes scaled to [0, 1].
fn unit_planes(image: &XrayImage) -> Vec<Array2<f32>> {
    let (w, h, c) = (
        image.width() as usize,
        image.height() as usize,
        image.channels() as usize,
    );
    let range = image.range();
    let samples = image.samples();
    (0..c)
        .map(|ch| Array2::from_shape_fn((h, w), |(y, x)| range.to_unit(samples[(y * w + x) * c + ch])))
        .collect()
}

fn collapse_to_luma(planes: Vec<Array2<f32>>) -> Array2<f32> {
    if let [r, g, b] = planes.as_slice() {
        return Array2::from_shape_fn(r.dim(), |idx| luma(r[idx], g[idx], b[idx]));
    }
    planes.into_iter().next().unwrap_or_else(|| Array2::zeros((0, 0)))
}

/// Deterministic channel reconciliation: 1 → 3 replicates, 3 → 1 collapses
/// with BT.601 luma weights.
fn reconcile_channels(planes: Vec<Array2<f32>>, target: usize) -> Vec<Array2<f32>> {
    match (planes.len(), target) {
        (n, t) if n == t => planes,
        (1, t) => {
            let plane = &planes[0];
            (0..t).map(|_| plane.clone()).collect()
        }
        (_, 1) => vec![collapse_to_luma(planes)],
        _ => planes,
    }
}

fn enhance_plane(enhancer: &ContrastEnhancer, plane: &Array2<f32>) -> Array2<f32> {
    let (h, w) = plane.dim();
    let gray = GrayImage::from_fn(w as u32, h as u32, |x, y| {
        Luma([(plane[[y as usize, x as usize]] * 255.0).round().clamp(0.0, 255.0) as u8])
    });
    let enhanced = enhancer.enhance(&gray);
    Array2::from_shape_fn((h, w), |(y, x)| enhanced.get_pixel(x as u32, y as u32).0[0] as f32 / 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::xray::ValueRange;

    fn small_spec(channels: usize) -> InputSpec {
        InputSpec {
            height: 16,
            width: 16,
            channels,
            scale: InputScale::UnitInterval,
        }
    }

    fn gradient_image(w: u32, h: u32, channels: u8) -> XrayImage {
        let mut samples = Vec::new();
        for y in 0..h {
            for x in 0..w {
                for c in 0..channels {
                    samples.push(((x * 5 + y * 3 + c as u32 * 40) % 256) as f32);
                }
            }
        }
        XrayImage::from_raw(w, h, channels, ValueRange::U8, samples).unwrap()
    }

    #[test]
    fn zero_width_rejected() {
        let img = XrayImage::from_raw(0, 32, 1, ValueRange::U8, vec![]).unwrap();
        let err = StandardPreprocessor::new(small_spec(3)).prepare(&img).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidImage(_)));
    }

    #[test]
    fn non_finite_sample_rejected() {
        let mut samples = vec![10.0; 64];
        samples[17] = f32::NAN;
        let img = XrayImage::from_raw(8, 8, 1, ValueRange::U8, samples).unwrap();
        let err = StandardPreprocessor::new(small_spec(1)).prepare(&img).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidImage(msg) if msg.contains("17")));
    }

    #[test]
    fn two_channel_image_rejected() {
        let img = XrayImage::from_raw(8, 8, 2, ValueRange::U8, vec![0.0; 128]).unwrap();
        let err = StandardPreprocessor::new(small_spec(1)).prepare(&img).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidImage(_)));
    }

    #[test]
    fn tiny_image_rejected() {
        let img = XrayImage::from_raw(4, 40, 1, ValueRange::U8, vec![0.0; 160]).unwrap();
        assert!(StandardPreprocessor::new(small_spec(1)).prepare(&img).is_err());
    }

    #[test]
    fn degenerate_range_rejected() {
        let img = XrayImage::from_raw(8, 8, 1, ValueRange::new(5.0, 5.0), vec![5.0; 64]).unwrap();
        assert!(StandardPreprocessor::new(small_spec(1)).prepare(&img).is_err());
    }

    #[test]
    fn bad_input_contract_is_a_model_fault() {
        let img = gradient_image(32, 32, 1);
        for spec in [small_spec(2), InputSpec { height: 0, ..small_spec(1) }] {
            let err = StandardPreprocessor::new(spec).prepare(&img).unwrap_err();
            assert!(matches!(err, AnalysisError::ModelUnavailable(_)), "got {err:?}");
        }
    }

    #[test]
    fn output_matches_model_resolution() {
        let tensor = StandardPreprocessor::new(small_spec(3))
            .prepare(&gradient_image(50, 30, 1))
            .unwrap();
        assert_eq!(tensor.dim(), (3, 16, 16));
        assert!(tensor.view().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn gray_replicated_into_identical_channels() {
        let tensor = StandardPreprocessor::new(small_spec(3))
            .prepare(&gradient_image(20, 20, 1))
            .unwrap();
        let view = tensor.view();
        assert_eq!(view.index_axis(Axis(0), 0), view.index_axis(Axis(0), 1));
        assert_eq!(view.index_axis(Axis(0), 1), view.index_axis(Axis(0), 2));
    }

    #[test]
    fn rgb_collapsed_to_luma() {
        let img = XrayImage::from_raw(8, 8, 3, ValueRange::U8, [255.0, 0.0, 0.0].repeat(64)).unwrap();
        let tensor = StandardPreprocessor::new(InputSpec {
            height: 8,
            width: 8,
            channels: 1,
            scale: InputScale::UnitInterval,
        })
        .prepare(&img)
        .unwrap();
        assert!(tensor.view().iter().all(|&v| (v - 0.299).abs() < 1e-5));
    }

    #[test]
    fn standardized_scale_applied() {
        let img = XrayImage::from_raw(8, 8, 1, ValueRange::U8, vec![255.0; 64]).unwrap();
        let spec = InputSpec {
            height: 8,
            width: 8,
            channels: 1,
            scale: InputScale::Standardized {
                mean: vec![0.5],
                std: vec![0.25],
            },
        };
        let tensor = StandardPreprocessor::new(spec).prepare(&img).unwrap();
        assert!(tensor.view().iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn invalid_standardization_rejected() {
        let spec = InputSpec {
            height: 8,
            width: 8,
            channels: 3,
            scale: InputScale::Standardized {
                mean: vec![0.5],
                std: vec![0.25],
            },
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn prepare_twice_yields_identical_tensor() {
        let pre = StandardPreprocessor::new(small_spec(3));
        let img = gradient_image(61, 47, 3);
        let a = pre.prepare(&img).unwrap();
        let b = pre.prepare(&img).unwrap();
        assert!(a
            .view()
            .iter()
            .zip(b.view().iter())
            .all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn contrast_enhancement_is_deterministic_and_changes_input() {
        let img = gradient_image(40, 40, 1);
        let plain = StandardPreprocessor::new(small_spec(1)).prepare(&img).unwrap();
        let pre = StandardPreprocessor::new(small_spec(1))
            .with_contrast_enhancement(ContrastEnhancer::default());
        let a = pre.prepare(&img).unwrap();
        let b = pre.prepare(&img).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, plain);
    }
}
