//! Classifier capability set and its adapters.
//!
//! A classifier is anything that, for one input tensor and in one call,
//! produces the Pneumonia probability AND the activation of a designated
//! feature layer together with the gradient of the positive-class score
//! w.r.t. that activation. Adapters:
//! - `ConvNetClassifier` — pure Rust CNN loaded from a JSON parameter artifact
//! - `OnnxClassifier` — ONNX Runtime graph exported with a gradient output
//!   (behind the `onnx` feature)

pub mod convnet;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use convnet::{ConvNetArtifact, ConvNetClassifier};
#[cfg(feature = "onnx")]
pub use onnx::OnnxClassifier;

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::preprocess::{InputSpec, InputTensor};
use super::types::Prediction;
use super::AnalysisError;

// ═══════════════════════════════════════════════════════════
// ActivationSnapshot
// ═══════════════════════════════════════════════════════════

/// Activation of one named layer plus the gradient of the positive-class
/// score w.r.t. that activation, from a single forward/backward pass.
///
/// Not `Clone`: the explainer takes it by value, so a snapshot is consumed by
/// exactly one explanation and cannot leak into another input's analysis.
#[derive(Debug)]
pub struct ActivationSnapshot {
    layer: String,
    activations: Array3<f32>,
    gradients: Array3<f32>,
}

impl ActivationSnapshot {
    /// Both tensors are `(channels, height, width)` and must share a shape.
    pub fn new(
        layer: impl Into<String>,
        activations: Array3<f32>,
        gradients: Array3<f32>,
    ) -> Result<Self, AnalysisError> {
        let layer = layer.into();
        if activations.dim() != gradients.dim() {
            return Err(AnalysisError::Inference(format!(
                "snapshot of layer '{layer}': activation shape {:?} != gradient shape {:?}",
                activations.dim(),
                gradients.dim()
            )));
        }
        if activations.is_empty() {
            return Err(AnalysisError::Inference(format!(
                "snapshot of layer '{layer}' is empty"
            )));
        }
        Ok(Self {
            layer,
            activations,
            gradients,
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn activations(&self) -> ArrayView3<'_, f32> {
        self.activations.view()
    }

    pub fn gradients(&self) -> ArrayView3<'_, f32> {
        self.gradients.view()
    }

    /// `(channels, height, width)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.activations.dim()
    }
}

// ═══════════════════════════════════════════════════════════
// Classifier trait
// ═══════════════════════════════════════════════════════════

/// Identity of the loaded model, copied into every decision record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub adapter: String,
    pub target_layer: String,
    /// Base64 SHA-256 of the parameter artifact, when loaded from disk.
    pub fingerprint: Option<String>,
}

pub trait Classifier: Send + Sync {
    /// One forward pass plus one backward pass of the positive-class score
    /// down to the designated layer. Parameters are read-only; every call
    /// returns its own snapshot.
    fn predict(&self, input: &InputTensor) -> Result<(Prediction, ActivationSnapshot), AnalysisError>;

    /// Input contract the preprocessor must satisfy.
    fn input_spec(&self) -> &InputSpec;

    fn descriptor(&self) -> &ModelDescriptor;

    fn target_layer(&self) -> &str {
        &self.descriptor().target_layer
    }
}

/// Allow `Box<dyn Classifier>` to be used as `&impl Classifier`.
impl Classifier for Box<dyn Classifier> {
    fn predict(&self, input: &InputTensor) -> Result<(Prediction, ActivationSnapshot), AnalysisError> {
        (**self).predict(input)
    }

    fn input_spec(&self) -> &InputSpec {
        (**self).input_spec()
    }

    fn descriptor(&self) -> &ModelDescriptor {
        (**self).descriptor()
    }
}

/// Load a classifier from a model path.
///
/// - `*.json` file → `ConvNetClassifier`
/// - directory with `model.onnx` → `OnnxClassifier` (requires the `onnx` feature)
pub fn load_classifier(path: &Path) -> Result<Arc<dyn Classifier>, AnalysisError> {
    if path.is_dir() {
        return load_onnx_dir(path);
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Arc::new(ConvNetClassifier::load(path)?)),
        _ if path.exists() => Err(AnalysisError::ModelUnavailable(format!(
            "unrecognized model artifact: {}",
            path.display()
        ))),
        _ => Err(AnalysisError::ModelUnavailable(format!(
            "model artifact not found: {}",
            path.display()
        ))),
    }
}

#[cfg(feature = "onnx")]
fn load_onnx_dir(path: &Path) -> Result<Arc<dyn Classifier>, AnalysisError> {
    Ok(Arc::new(OnnxClassifier::load(path)?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx_dir(path: &Path) -> Result<Arc<dyn Classifier>, AnalysisError> {
    Err(AnalysisError::ModelUnavailable(format!(
        "{} is an ONNX model directory but this build lacks the `onnx` feature",
        path.display()
    )))
}

// ═══════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════

/// Base64 SHA-256 of an artifact's bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(bytes))
}

/// Compare an artifact against its optional `<artifact>.sha256` sidecar.
pub fn verify_sidecar_checksum(path: &Path, digest: &str) -> Result<(), AnalysisError> {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    let sidecar = Path::new(&sidecar);
    if !sidecar.exists() {
        return Ok(());
    }
    let expected = std::fs::read_to_string(sidecar).map_err(|e| {
        AnalysisError::ModelUnavailable(format!("checksum file {}: {e}", sidecar.display()))
    })?;
    if expected.trim() != digest {
        return Err(AnalysisError::ModelUnavailable(format!(
            "checksum mismatch for {}: artifact is corrupt or was replaced",
            path.display()
        )));
    }
    Ok(())
}

pub(crate) fn ensure_input_shape(input: &InputTensor, spec: &InputSpec) -> Result<(), AnalysisError> {
    let expected = (spec.channels, spec.height, spec.width);
    if input.dim() != expected {
        return Err(AnalysisError::Inference(format!(
            "input tensor shape {:?} does not match model input {:?}",
            input.dim(),
            expected
        )));
    }
    Ok(())
}

/// Overflow-safe logistic function.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
