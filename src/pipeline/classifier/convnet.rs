//! Pure Rust convolutional classifier.
//!
//! Architecture family: `conv → ReLU` stages, global average pooling, one
//! dense unit, sigmoid. The positive-class score used for gradients is the
//! pre-sigmoid logit (it does not saturate the way the probability does).
//!
//! Parameters come from a JSON artifact produced by the training side:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "name": "pneumonia-convnet",
//!   "input": { "height": 224, "width": 224, "channels": 3 },
//!   "layers": [
//!     { "name": "conv1", "in_channels": 3, "out_channels": 16, "kernel": 3,
//!       "stride": 2, "padding": 1, "weights": [...], "bias": [...] }
//!   ],
//!   "head": { "weights": [...], "bias": 0.0 },
//!   "target_layer": "conv1"
//! }
//! ```
//!
//! An optional `<artifact>.sha256` sidecar (base64 SHA-256) is verified on load.

use std::collections::HashSet;
use std::path::Path;

use ndarray::{Array1, Array3, Array4, ArrayView3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    ensure_input_shape, fingerprint, sigmoid, verify_sidecar_checksum, ActivationSnapshot,
    Classifier, ModelDescriptor,
};
use crate::pipeline::preprocess::{InputSpec, InputTensor};
use crate::pipeline::types::Prediction;
use crate::pipeline::AnalysisError;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

const ADAPTER_NAME: &str = "convnet";

// ═══════════════════════════════════════════════════════════
// Artifact schema
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvLayerParams {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub padding: usize,
    /// `[out_channels, in_channels, kernel, kernel]`, row-major.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

fn default_stride() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseHeadParams {
    pub weights: Vec<f32>,
    pub bias: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNetArtifact {
    pub format_version: u32,
    pub name: String,
    pub input: InputSpec,
    pub layers: Vec<ConvLayerParams>,
    pub head: DenseHeadParams,
    /// Layer whose activation feeds the saliency map. Defaults to the last one.
    #[serde(default)]
    pub target_layer: Option<String>,
}

// ═══════════════════════════════════════════════════════════
// Layers
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct ConvLayer {
    name: String,
    stride: usize,
    padding: usize,
    /// `(out, in, k, k)`.
    weights: Array4<f32>,
    bias: Array1<f32>,
}

impl ConvLayer {
    fn from_params(p: ConvLayerParams) -> Result<Self, String> {
        if p.kernel == 0 || p.stride == 0 || p.in_channels == 0 || p.out_channels == 0 {
            return Err(format!(
                "layer '{}': kernel, stride and channel counts must be non-zero",
                p.name
            ));
        }
        if p.padding >= p.kernel {
            return Err(format!(
                "layer '{}': padding {} must be smaller than kernel {}",
                p.name, p.padding, p.kernel
            ));
        }
        if p.bias.len() != p.out_channels {
            return Err(format!(
                "layer '{}': {} biases for {} output channels",
                p.name,
                p.bias.len(),
                p.out_channels
            ));
        }
        if p.weights.iter().chain(p.bias.iter()).any(|v| !v.is_finite()) {
            return Err(format!("layer '{}': non-finite parameter", p.name));
        }
        let shape = (p.out_channels, p.in_channels, p.kernel, p.kernel);
        let weights = Array4::from_shape_vec(shape, p.weights)
            .map_err(|e| format!("layer '{}': weights do not match {shape:?}: {e}", p.name))?;
        Ok(Self {
            name: p.name,
            stride: p.stride,
            padding: p.padding,
            weights,
            bias: Array1::from_vec(p.bias),
        })
    }

    fn in_channels(&self) -> usize {
        self.weights.dim().1
    }

    fn out_channels(&self) -> usize {
        self.weights.dim().0
    }

    fn kernel(&self) -> usize {
        self.weights.dim().2
    }

    /// Output spatial size, or `None` when the kernel does not fit.
    fn output_dims(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let k = self.kernel();
        let pad = self.padding.checked_mul(2)?;
        let (ph, pw) = (h.checked_add(pad)?, w.checked_add(pad)?);
        if ph < k || pw < k {
            return None;
        }
        Some(((ph - k) / self.stride + 1, (pw - k) / self.stride + 1))
    }

    /// Input coordinate for output position `o` and kernel tap `t`, if inside.
    fn source(&self, o: usize, t: usize, len: usize) -> Option<usize> {
        let pos = (o * self.stride + t) as isize - self.padding as isize;
        (pos >= 0 && (pos as usize) < len).then_some(pos as usize)
    }

    /// Convolution + bias + ReLU.
    fn forward(&self, input: ArrayView3<'_, f32>) -> Array3<f32> {
        let (in_c, h, w) = input.dim();
        let (oh, ow) = self.output_dims(h, w).unwrap_or((0, 0));
        let k = self.kernel();
        let mut out = Array3::zeros((self.out_channels(), oh, ow));
        for o in 0..self.out_channels() {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = self.bias[o];
                    for i in 0..in_c {
                        for ky in 0..k {
                            let Some(iy) = self.source(oy, ky, h) else { continue };
                            for kx in 0..k {
                                let Some(ix) = self.source(ox, kx, w) else { continue };
                                acc += self.weights[[o, i, ky, kx]] * input[[i, iy, ix]];
                            }
                        }
                    }
                    out[[o, oy, ox]] = acc.max(0.0);
                }
            }
        }
        out
    }

    /// Gradient w.r.t. this layer's input, given the gradient w.r.t. its
    /// (post-ReLU) output and that output itself for the ReLU gate.
    fn backward(
        &self,
        grad_out: ArrayView3<'_, f32>,
        activated: ArrayView3<'_, f32>,
        input_dim: (usize, usize, usize),
    ) -> Array3<f32> {
        let (in_c, h, w) = input_dim;
        let (out_c, oh, ow) = grad_out.dim();
        let k = self.kernel();
        let mut grad_in = Array3::zeros(input_dim);
        for o in 0..out_c {
            for oy in 0..oh {
                for ox in 0..ow {
                    if activated[[o, oy, ox]] <= 0.0 {
                        continue;
                    }
                    let g = grad_out[[o, oy, ox]];
                    if g == 0.0 {
                        continue;
                    }
                    for i in 0..in_c {
                        for ky in 0..k {
                            let Some(iy) = self.source(oy, ky, h) else { continue };
                            for kx in 0..k {
                                let Some(ix) = self.source(ox, kx, w) else { continue };
                                grad_in[[i, iy, ix]] += self.weights[[o, i, ky, kx]] * g;
                            }
                        }
                    }
                }
            }
        }
        grad_in
    }
}

// ═══════════════════════════════════════════════════════════
// Classifier
// ═══════════════════════════════════════════════════════════

/// CNN classifier with analytic backward pass to the target layer.
///
/// Immutable after construction; safe to share across threads. Each
/// `predict` allocates its own activation cache.
#[derive(Debug, Clone)]
pub struct ConvNetClassifier {
    layers: Vec<ConvLayer>,
    head_weights: Array1<f32>,
    head_bias: f32,
    target: usize,
    spec: InputSpec,
    descriptor: ModelDescriptor,
}

impl ConvNetClassifier {
    /// Load a JSON artifact from disk.
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        if !path.exists() {
            return Err(AnalysisError::ModelUnavailable(format!(
                "model artifact not found: {}",
                path.display()
            )));
        }
        let bytes = std::fs::read(path).map_err(|e| {
            AnalysisError::ModelUnavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        let digest = fingerprint(&bytes);
        verify_sidecar_checksum(path, &digest)?;

        let artifact: ConvNetArtifact = serde_json::from_slice(&bytes).map_err(|e| {
            AnalysisError::ModelUnavailable(format!("cannot parse {}: {e}", path.display()))
        })?;
        let classifier = Self::from_artifact(artifact, Some(digest))?;

        info!(
            path = %path.display(),
            model = %classifier.descriptor.name,
            layers = classifier.layers.len(),
            target_layer = %classifier.descriptor.target_layer,
            "ConvNet classifier loaded"
        );
        Ok(classifier)
    }

    /// Build from an in-memory artifact, validating every shape.
    pub fn from_artifact(
        artifact: ConvNetArtifact,
        fingerprint: Option<String>,
    ) -> Result<Self, AnalysisError> {
        let unavailable =
            |msg: String| AnalysisError::ModelUnavailable(format!("{}: {msg}", artifact.name));

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(unavailable(format!(
                "unsupported format_version {} (expected {ARTIFACT_FORMAT_VERSION})",
                artifact.format_version
            )));
        }
        artifact.input.validate().map_err(unavailable)?;
        if artifact.layers.is_empty() {
            return Err(unavailable("artifact has no convolution layers".into()));
        }

        let mut names = HashSet::new();
        for layer in &artifact.layers {
            if !names.insert(layer.name.as_str()) {
                return Err(unavailable(format!("duplicate layer name '{}'", layer.name)));
            }
        }

        let target = match &artifact.target_layer {
            Some(name) => artifact
                .layers
                .iter()
                .position(|l| &l.name == name)
                .ok_or_else(|| unavailable(format!("target layer '{name}' not in artifact")))?,
            None => artifact.layers.len() - 1,
        };

        let layers = artifact
            .layers
            .iter()
            .cloned()
            .map(ConvLayer::from_params)
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        // Channel chaining + spatial feasibility
        let (mut channels, mut h, mut w) =
            (artifact.input.channels, artifact.input.height, artifact.input.width);
        for layer in &layers {
            if layer.in_channels() != channels {
                return Err(unavailable(format!(
                    "layer '{}' expects {} input channels, receives {channels}",
                    layer.name,
                    layer.in_channels()
                )));
            }
            (h, w) = layer.output_dims(h, w).ok_or_else(|| {
                unavailable(format!("layer '{}' kernel does not fit {h}x{w} input", layer.name))
            })?;
            channels = layer.out_channels();
        }

        if artifact.head.weights.len() != channels {
            return Err(unavailable(format!(
                "head has {} weights for {channels} pooled features",
                artifact.head.weights.len()
            )));
        }
        if artifact.head.weights.iter().any(|v| !v.is_finite()) || !artifact.head.bias.is_finite() {
            return Err(unavailable("head has non-finite parameters".into()));
        }

        let descriptor = ModelDescriptor {
            name: artifact.name.clone(),
            adapter: ADAPTER_NAME.into(),
            target_layer: layers[target].name.clone(),
            fingerprint,
        };

        Ok(Self {
            layers,
            head_weights: Array1::from_vec(artifact.head.weights),
            head_bias: artifact.head.bias,
            target,
            spec: artifact.input,
            descriptor,
        })
    }

    /// Post-ReLU output of every layer, in order.
    fn forward(&self, input: ArrayView3<'_, f32>) -> Vec<Array3<f32>> {
        let mut outputs: Vec<Array3<f32>> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let next = match outputs.last() {
                Some(prev) => layer.forward(prev.view()),
                None => layer.forward(input),
            };
            outputs.push(next);
        }
        outputs
    }

    /// Global average pool + dense unit → logit.
    fn head_logit(&self, features: ArrayView3<'_, f32>) -> f32 {
        let (channels, h, w) = features.dim();
        let area = (h * w) as f32;
        let mut logit = self.head_bias;
        for c in 0..channels {
            let pooled = features.index_axis(ndarray::Axis(0), c).sum() / area;
            logit += self.head_weights[c] * pooled;
        }
        logit
    }

    /// d(logit)/d(target activation).
    fn backward(&self, outputs: &[Array3<f32>]) -> Array3<f32> {
        let last = &outputs[outputs.len() - 1];
        let (channels, h, w) = last.dim();
        let area = (h * w) as f32;
        let mut grad = Array3::from_shape_fn((channels, h, w), |(c, _, _)| self.head_weights[c] / area);

        for j in (self.target + 1..self.layers.len()).rev() {
            grad = self.layers[j].backward(grad.view(), outputs[j].view(), outputs[j - 1].dim());
        }
        grad
    }

    /// Logit computed from a (possibly perturbed) target-layer activation.
    #[cfg(test)]
    fn logit_from_target(&self, activation: Array3<f32>) -> f32 {
        let mut current = activation;
        for layer in &self.layers[self.target + 1..] {
            current = layer.forward(current.view());
        }
        self.head_logit(current.view())
    }
}

impl Classifier for ConvNetClassifier {
    fn predict(&self, input: &InputTensor) -> Result<(Prediction, ActivationSnapshot), AnalysisError> {
        ensure_input_shape(input, &self.spec)?;

        let outputs = self.forward(input.view());
        let logit = self.head_logit(outputs[outputs.len() - 1].view());
        if !logit.is_finite() {
            return Err(AnalysisError::Inference(format!(
                "{}: forward pass overflowed (logit = {logit})",
                self.descriptor.name
            )));
        }
        let prediction = Prediction::new(sigmoid(logit))?;

        let gradients = self.backward(&outputs);
        if gradients.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::Inference(format!(
                "{}: backward pass produced non-finite gradients",
                self.descriptor.name
            )));
        }

        let activation = outputs
            .into_iter()
            .nth(self.target)
            .ok_or_else(|| AnalysisError::Inference("target activation missing".into()))?;
        let snapshot = ActivationSnapshot::new(&self.descriptor.target_layer, activation, gradients)?;

        debug!(
            model = %self.descriptor.name,
            logit,
            probability = prediction.probability(),
            layer = snapshot.layer(),
            feature_map = format!("{:?}", snapshot.dim()),
            "ConvNet forward/backward complete"
        );
        Ok((prediction, snapshot))
    }

    fn input_spec(&self) -> &InputSpec {
        &self.spec
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}

// ═══════════════════════════════════════════════════════════
// Test fixtures
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::pipeline::preprocess::InputScale;

    fn patterned(len: usize, seed: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (((i + seed) * 37 % 11) as f32 - 5.0) / 10.0)
            .collect()
    }

    fn layer(name: &str, inc: usize, outc: usize, stride: usize, weights: Vec<f32>, bias: f32) -> ConvLayerParams {
        ConvLayerParams {
            name: name.into(),
            in_channels: inc,
            out_channels: outc,
            kernel: 3,
            stride,
            padding: 1,
            weights,
            bias: vec![bias; outc],
        }
    }

    /// 1x8x8 input → conv1 (2ch, 8x8) → conv2 (3ch, 4x4) → head. Mixed-sign weights.
    pub(crate) fn tiny_artifact() -> ConvNetArtifact {
        ConvNetArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            name: "tiny-convnet".into(),
            input: InputSpec {
                height: 8,
                width: 8,
                channels: 1,
                scale: InputScale::UnitInterval,
            },
            layers: vec![
                layer("conv1", 1, 2, 1, patterned(18, 1), 0.05),
                layer("conv2", 2, 3, 2, patterned(54, 3), 0.05),
            ],
            head: DenseHeadParams {
                weights: vec![0.8, -0.3, 0.5],
                bias: -0.1,
            },
            target_layer: None,
        }
    }

    /// Same topology with strictly positive conv weights: every unit stays in
    /// the linear regime for non-negative inputs.
    pub(crate) fn linear_regime_artifact() -> ConvNetArtifact {
        let mut artifact = tiny_artifact();
        artifact.layers[0].weights = (0..18).map(|i| 0.05 + i as f32 * 0.01).collect();
        artifact.layers[1].weights = (0..54).map(|i| 0.02 + (i % 7) as f32 * 0.01).collect();
        artifact.layers[0].bias = vec![0.1; 2];
        artifact.layers[1].bias = vec![0.1; 3];
        artifact
    }

    pub(crate) fn tiny_classifier() -> ConvNetClassifier {
        ConvNetClassifier::from_artifact(tiny_artifact(), None).unwrap()
    }

    pub(crate) fn input_8x8(seed: usize) -> InputTensor {
        InputTensor::new(Array3::from_shape_fn((1, 8, 8), |(_, y, x)| {
            ((y * 8 + x + seed) % 17) as f32 / 16.0
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn write_artifact(dir: &Path, artifact: &ConvNetArtifact) -> std::path::PathBuf {
        let path = dir.join("model.json");
        std::fs::write(&path, serde_json::to_vec(artifact).unwrap()).unwrap();
        path
    }

    fn expect_unavailable(artifact: ConvNetArtifact) {
        let err = ConvNetClassifier::from_artifact(artifact, None).unwrap_err();
        assert!(matches!(err, AnalysisError::ModelUnavailable(_)), "got {err:?}");
    }

    // ── Loading ──

    #[test]
    fn load_records_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), &tiny_artifact());
        let clf = ConvNetClassifier::load(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(clf.descriptor().fingerprint, Some(fingerprint(&bytes)));
        assert_eq!(clf.descriptor().adapter, "convnet");
        assert_eq!(clf.target_layer(), "conv2");
    }

    #[test]
    fn load_missing_file_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConvNetClassifier::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, AnalysisError::ModelUnavailable(_)));
    }

    #[test]
    fn load_corrupt_json_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, b"{\"format_version\": 1, \"name\": ").unwrap();
        let err = ConvNetClassifier::load(&path).unwrap_err();
        assert!(matches!(err, AnalysisError::ModelUnavailable(_)));
    }

    #[test]
    fn load_verifies_matching_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), &tiny_artifact());
        let digest = fingerprint(&std::fs::read(&path).unwrap());
        std::fs::write(dir.path().join("model.json.sha256"), format!("{digest}\n")).unwrap();
        assert!(ConvNetClassifier::load(&path).is_ok());
    }

    #[test]
    fn load_rejects_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), &tiny_artifact());
        std::fs::write(dir.path().join("model.json.sha256"), fingerprint(b"other")).unwrap();
        let err = ConvNetClassifier::load(&path).unwrap_err();
        assert!(matches!(err, AnalysisError::ModelUnavailable(msg) if msg.contains("checksum")));
    }

    // ── Validation ──

    #[test]
    fn rejects_wrong_format_version() {
        let mut a = tiny_artifact();
        a.format_version = 2;
        expect_unavailable(a);
    }

    #[test]
    fn rejects_weight_count_mismatch() {
        let mut a = tiny_artifact();
        a.layers[1].weights.pop();
        expect_unavailable(a);
    }

    #[test]
    fn rejects_broken_channel_chain() {
        let mut a = tiny_artifact();
        a.layers[1].in_channels = 3;
        a.layers[1].weights = vec![0.1; 3 * 3 * 9];
        expect_unavailable(a);
    }

    #[test]
    fn rejects_head_size_mismatch() {
        let mut a = tiny_artifact();
        a.head.weights = vec![1.0, 2.0];
        expect_unavailable(a);
    }

    #[test]
    fn rejects_unknown_target_layer() {
        let mut a = tiny_artifact();
        a.target_layer = Some("conv9".into());
        expect_unavailable(a);
    }

    #[test]
    fn rejects_duplicate_layer_names() {
        let mut a = tiny_artifact();
        a.layers[1].name = "conv1".into();
        expect_unavailable(a);
    }

    #[test]
    fn rejects_non_finite_parameters() {
        let mut a = tiny_artifact();
        a.layers[0].bias[0] = f32::NAN;
        expect_unavailable(a);
    }

    #[test]
    fn rejects_kernel_larger_than_feature_map() {
        let mut a = tiny_artifact();
        a.input.height = 1;
        a.input.width = 1;
        a.layers[0].padding = 0;
        expect_unavailable(a);
    }

    #[test]
    fn rejects_padding_not_smaller_than_kernel() {
        let mut a = tiny_artifact();
        a.layers[0].padding = usize::MAX / 2 + 1;
        expect_unavailable(a);
        let mut a = tiny_artifact();
        a.layers[1].padding = a.layers[1].kernel;
        expect_unavailable(a);
    }

    #[test]
    fn output_dims_reports_overflow_as_unfit() {
        let mut params = tiny_artifact().layers.remove(0);
        params.padding = 0;
        let mut layer = ConvLayer::from_params(params).unwrap();
        layer.padding = usize::MAX / 2 + 1;
        assert_eq!(layer.output_dims(8, 8), None);
        layer.padding = 1;
        assert_eq!(layer.output_dims(usize::MAX, 8), None);
    }

    // ── Inference ──

    #[test]
    fn predict_returns_probability_and_target_snapshot() {
        let clf = tiny_classifier();
        let (p, snap) = clf.predict(&input_8x8(0)).unwrap();
        assert!((0.0..=1.0).contains(&p.probability()));
        assert_eq!(snap.layer(), "conv2");
        assert_eq!(snap.dim(), (3, 4, 4));
    }

    #[test]
    fn predict_rejects_wrong_input_shape() {
        let clf = tiny_classifier();
        let input = InputTensor::new(Array3::zeros((3, 8, 8)));
        assert!(matches!(clf.predict(&input), Err(AnalysisError::Inference(_))));
    }

    #[test]
    fn last_layer_gradient_is_head_weight_over_area() {
        let clf = tiny_classifier();
        let (_, snap) = clf.predict(&input_8x8(2)).unwrap();
        let expected = [0.8 / 16.0, -0.3 / 16.0, 0.5 / 16.0];
        for (c, &e) in expected.iter().enumerate() {
            let channel = snap.gradients().index_axis(ndarray::Axis(0), c).to_owned();
            assert!(channel.iter().all(|&g| (g - e).abs() < 1e-7));
        }
    }

    #[test]
    fn earlier_target_layer_gets_backpropagated_gradient() {
        let mut a = tiny_artifact();
        a.target_layer = Some("conv1".into());
        let clf = ConvNetClassifier::from_artifact(a, None).unwrap();
        let (_, snap) = clf.predict(&input_8x8(1)).unwrap();
        assert_eq!(snap.layer(), "conv1");
        assert_eq!(snap.dim(), (2, 8, 8));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut a = linear_regime_artifact();
        a.target_layer = Some("conv1".into());
        let clf = ConvNetClassifier::from_artifact(a, None).unwrap();
        let input = input_8x8(5);
        let (_, snap) = clf.predict(&input).unwrap();
        let base = clf.forward(input.view()).into_iter().next().unwrap();

        let eps = 1e-2f32;
        for &(c, y, x) in &[(0, 0, 0), (1, 3, 4), (0, 7, 7), (1, 5, 2)] {
            let mut plus = base.clone();
            plus[[c, y, x]] += eps;
            let mut minus = base.clone();
            minus[[c, y, x]] -= eps;
            let numeric = (clf.logit_from_target(plus) - clf.logit_from_target(minus)) / (2.0 * eps);
            let analytic = snap.gradients()[[c, y, x]];
            assert!(
                (numeric - analytic).abs() < 1e-3,
                "({c},{y},{x}): numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn backward_respects_relu_gates() {
        let mut a = tiny_artifact();
        a.target_layer = Some("conv1".into());
        let clf = ConvNetClassifier::from_artifact(a, None).unwrap();
        let input = input_8x8(5);
        let (_, snap) = clf.predict(&input).unwrap();
        let outputs = clf.forward(input.view());
        let (base, gated) = (&outputs[0], &outputs[1]);

        let dead = gated.iter().filter(|&&v| v <= 0.0).count();
        assert!(dead > 0 && dead < gated.len(), "{dead}/{} conv2 units off", gated.len());

        // Central differences are exact while no conv2 unit changes state.
        let conv2 = &clf.layers[1];
        let same_gates = |act: &Array3<f32>| {
            conv2
                .forward(act.view())
                .iter()
                .zip(gated.iter())
                .all(|(a, b)| (*a > 0.0) == (*b > 0.0))
        };
        let eps = 2e-3f32;
        let mut checked = 0;
        for ((c, y, x), _) in base.indexed_iter() {
            let mut plus = base.clone();
            plus[[c, y, x]] += eps;
            let mut minus = base.clone();
            minus[[c, y, x]] -= eps;
            if !same_gates(&plus) || !same_gates(&minus) {
                continue;
            }
            let numeric = (clf.logit_from_target(plus) - clf.logit_from_target(minus)) / (2.0 * eps);
            let analytic = snap.gradients()[[c, y, x]];
            assert!(
                (numeric - analytic).abs() < 1e-3,
                "({c},{y},{x}): numeric {numeric} vs analytic {analytic}"
            );
            checked += 1;
        }
        assert!(checked * 2 > base.len(), "only {checked}/{} positions checked", base.len());
    }

    #[test]
    fn predict_is_bit_reproducible() {
        let clf = tiny_classifier();
        let (p1, s1) = clf.predict(&input_8x8(3)).unwrap();
        let (p2, s2) = clf.predict(&input_8x8(3)).unwrap();
        assert_eq!(p1.probability().to_bits(), p2.probability().to_bits());
        assert_eq!(s1.activations(), s2.activations());
        assert_eq!(s1.gradients(), s2.gradients());
    }

    #[test]
    fn concurrent_predictions_match_sequential() {
        let clf = std::sync::Arc::new(tiny_classifier());
        let sequential: Vec<f32> = (0..4)
            .map(|s| clf.predict(&input_8x8(s)).unwrap().0.probability())
            .collect();
        let parallel: Vec<f32> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|s| {
                    let clf = clf.clone();
                    scope.spawn(move || clf.predict(&input_8x8(s)).unwrap().0.probability())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn artifact_json_round_trip() {
        let artifact = tiny_artifact();
        let json = serde_json::to_string(&artifact).unwrap();
        let parsed: ConvNetArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, artifact);
    }

    #[test]
    fn stride_and_padding_default_when_omitted() {
        let json = r#"{"name":"c","in_channels":1,"out_channels":1,"kernel":1,"weights":[1.0],"bias":[0.0]}"#;
        let layer: ConvLayerParams = serde_json::from_str(json).unwrap();
        assert_eq!((layer.stride, layer.padding), (1, 0));
    }
}
