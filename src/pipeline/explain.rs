//! Grad-CAM saliency.
//!
//! Per-channel weight = spatial mean of the gradient; map = ReLU of the
//! weighted channel sum, resized to the image resolution and divided by its
//! maximum. An all-zero map is a valid "no localized evidence" result.

use ndarray::{Array2, Axis};
use serde::Serialize;
use tracing::debug;

use super::classifier::ActivationSnapshot;
use super::resample::resize_bilinear;
use super::AnalysisError;

// ═══════════════════════════════════════════════════════════
// SaliencyMap
// ═══════════════════════════════════════════════════════════

/// Non-negative importance grid at the source image's resolution, row-major.
///
/// Values are finite and in [0, 1]; a non-zero map has maximum exactly 1.0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaliencyMap {
    height: usize,
    width: usize,
    values: Vec<f32>,
}

impl SaliencyMap {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            values: vec![0.0; height * width],
        }
    }

    /// Build from row-major values in [0, 1].
    pub fn from_values(height: usize, width: usize, values: Vec<f32>) -> Result<Self, AnalysisError> {
        if values.len() != height * width {
            return Err(AnalysisError::Inference(format!(
                "saliency has {} values for {width}x{height}",
                values.len()
            )));
        }
        if values.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(AnalysisError::Inference("saliency values must lie in [0, 1]".into()));
        }
        Ok(Self {
            height,
            width,
            values,
        })
    }

    fn from_array(plane: Array2<f32>) -> Self {
        let (height, width) = plane.dim();
        Self {
            height,
            width,
            values: plane.into_iter().collect(),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at row `y`, column `x`.
    pub fn get(&self, y: usize, x: usize) -> Option<f32> {
        (y < self.height && x < self.width).then(|| self.values[y * self.width + x])
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    /// True for the "no localized evidence" map.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    /// `(height, width)` copy for array-based consumers.
    pub fn to_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.height, self.width), |(y, x)| self.values[y * self.width + x])
    }
}

// ═══════════════════════════════════════════════════════════
// Explainer
// ═══════════════════════════════════════════════════════════

pub trait Explainer: Send + Sync {
    /// Consume one snapshot and produce a `height x width` map.
    fn explain(
        &self,
        snapshot: ActivationSnapshot,
        height: usize,
        width: usize,
    ) -> Result<SaliencyMap, AnalysisError>;
}

/// Gradient-weighted class activation mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradCamExplainer;

impl Explainer for GradCamExplainer {
    fn explain(
        &self,
        snapshot: ActivationSnapshot,
        height: usize,
        width: usize,
    ) -> Result<SaliencyMap, AnalysisError> {
        if height == 0 || width == 0 {
            return Err(AnalysisError::Inference(format!(
                "saliency target resolution must be non-zero, got {width}x{height}"
            )));
        }
        let activations = snapshot.activations();
        let gradients = snapshot.gradients();
        if activations.iter().chain(gradients.iter()).any(|v| !v.is_finite()) {
            return Err(AnalysisError::Inference(format!(
                "layer '{}' snapshot contains non-finite values",
                snapshot.layer()
            )));
        }

        let (channels, fh, fw) = snapshot.dim();
        let area = (fh * fw) as f32;
        let weights: Vec<f32> = gradients
            .axis_iter(Axis(0))
            .map(|g| g.sum() / area)
            .collect();
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(AnalysisError::Inference(format!(
                "layer '{}' channel weights overflowed",
                snapshot.layer()
            )));
        }

        if weights.iter().all(|&w| w <= 0.0) {
            debug!(layer = snapshot.layer(), channels, "No positive channel weight, zero saliency");
            return Ok(SaliencyMap::zeros(height, width));
        }

        let mut cam = Array2::<f32>::zeros((fh, fw));
        for (w, channel) in weights.iter().zip(activations.axis_iter(Axis(0))) {
            cam.scaled_add(*w, &channel);
        }
        cam.mapv_inplace(|v| v.max(0.0));
        if cam.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::Inference(format!(
                "layer '{}' weighted activation sum overflowed",
                snapshot.layer()
            )));
        }

        let mut map = resize_bilinear(cam.view(), height, width);
        let peak = map.iter().copied().fold(0.0f32, f32::max);
        if !peak.is_finite() {
            return Err(AnalysisError::Inference(format!(
                "layer '{}' saliency peak is not finite",
                snapshot.layer()
            )));
        }
        if peak > 0.0 {
            map.mapv_inplace(|v| v / peak);
        }

        debug!(
            layer = snapshot.layer(),
            feature_map = format!("{channels}x{fh}x{fw}"),
            output = format!("{width}x{height}"),
            positive_channels = weights.iter().filter(|&&w| w > 0.0).count(),
            "Grad-CAM computed"
        );
        Ok(SaliencyMap::from_array(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn snapshot(act: Vec<f32>, grad: Vec<f32>, dim: (usize, usize, usize)) -> ActivationSnapshot {
        ActivationSnapshot::new(
            "layer",
            Array3::from_shape_vec(dim, act).unwrap(),
            Array3::from_shape_vec(dim, grad).unwrap(),
        )
        .unwrap()
    }

    fn reference_snapshot() -> ActivationSnapshot {
        snapshot(
            vec![
                1.0, 1.0, 1.0, 1.0, // channel 0
                0.5, 1.0, 1.5, 2.0, // channel 1
            ],
            vec![
                1.0, 1.0, 1.0, 1.0, // channel 0
                0.0, 0.0, 0.0, 0.4, // channel 1
            ],
            (2, 2, 2),
        )
    }

    #[test]
    fn weighted_sum_normalized_by_peak() {
        // weights = [1.0, 0.1] → cam = [1.05, 1.1, 1.15, 1.2]
        let map = GradCamExplainer.explain(reference_snapshot(), 2, 2).unwrap();
        let expected = [1.05 / 1.2, 1.1 / 1.2, 1.15 / 1.2, 1.0];
        for (v, e) in map.values().iter().zip(expected) {
            assert!((v - e).abs() < 1e-6, "{v} vs {e}");
        }
    }

    #[test]
    fn peak_is_exactly_one_after_upsampling() {
        let map = GradCamExplainer.explain(reference_snapshot(), 37, 53).unwrap();
        assert_eq!((map.height(), map.width()), (37, 53));
        assert_eq!(map.max(), 1.0);
        assert!(map.values().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn non_positive_weights_yield_zero_map() {
        let snap = snapshot(vec![1.0, 2.0, 3.0, 4.0], vec![-1.0, 0.0, -0.5, 0.2], (1, 2, 2));
        let map = GradCamExplainer.explain(snap, 10, 12).unwrap();
        assert!(map.is_zero());
        assert_eq!(map.values().len(), 120);
    }

    #[test]
    fn all_zero_gradients_yield_zero_map() {
        let snap = snapshot(vec![1.0; 8], vec![0.0; 8], (2, 2, 2));
        assert!(GradCamExplainer.explain(snap, 4, 4).unwrap().is_zero());
    }

    #[test]
    fn negative_contributions_are_clipped() {
        // channel 0 pulls positive, channel 1 pushes harder negative at (1,1)
        let snap = snapshot(
            vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 5.0],
            vec![1.0, 1.0, 1.0, 1.0, -0.5, -0.5, -0.5, -0.5],
            (2, 2, 2),
        );
        let map = GradCamExplainer.explain(snap, 2, 2).unwrap();
        assert_eq!(map.get(1, 1), Some(0.0));
        assert_eq!(map.get(0, 0), Some(1.0));
    }

    #[test]
    fn non_finite_snapshot_rejected() {
        let snap = snapshot(vec![1.0, f32::NAN, 1.0, 1.0], vec![1.0; 4], (1, 2, 2));
        assert!(matches!(
            GradCamExplainer.explain(snap, 4, 4),
            Err(AnalysisError::Inference(_))
        ));
    }

    #[test]
    fn overflowing_weighted_sum_rejected() {
        let snap = snapshot(vec![3.0e38; 8], vec![2.0; 8], (2, 2, 2));
        assert!(matches!(
            GradCamExplainer.explain(snap, 4, 4),
            Err(AnalysisError::Inference(_))
        ));
    }

    #[test]
    fn overflowing_channel_weight_rejected() {
        let snap = snapshot(vec![1.0; 4], vec![3.0e38; 4], (1, 2, 2));
        assert!(matches!(
            GradCamExplainer.explain(snap, 4, 4),
            Err(AnalysisError::Inference(_))
        ));
    }

    #[test]
    fn zero_target_resolution_rejected() {
        assert!(GradCamExplainer.explain(reference_snapshot(), 0, 4).is_err());
    }

    #[test]
    fn explanation_is_bit_reproducible() {
        let a = GradCamExplainer.explain(reference_snapshot(), 31, 17).unwrap();
        let b = GradCamExplainer.explain(reference_snapshot(), 31, 17).unwrap();
        assert!(a
            .values()
            .iter()
            .zip(b.values())
            .all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn from_values_validates() {
        assert!(SaliencyMap::from_values(2, 2, vec![0.0, 0.5, 1.0, 0.2]).is_ok());
        assert!(SaliencyMap::from_values(2, 2, vec![0.0; 3]).is_err());
        assert!(SaliencyMap::from_values(1, 1, vec![f32::NAN]).is_err());
        assert!(SaliencyMap::from_values(1, 1, vec![1.5]).is_err());
    }

    #[test]
    fn array_copy_matches_layout() {
        let map = GradCamExplainer.explain(reference_snapshot(), 2, 2).unwrap();
        let array = map.to_array();
        assert_eq!(array.dim(), (2, 2));
        assert_eq!(array[[1, 1]], 1.0);
        assert_eq!(map.get(2, 0), None);
    }
}
