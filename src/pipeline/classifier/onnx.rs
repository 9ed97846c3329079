//! ONNX Runtime classifier adapter.
//!
//! The exported graph must produce, in one run, the Pneumonia probability,
//! the target-layer activation and the gradient of the positive-class score
//! w.r.t. that activation. Model directory layout:
//! - `model.onnx` — the graph
//! - `manifest.json` — input contract, target layer, output positions
//!
//! `model.onnx` may carry a `model.onnx.sha256` sidecar.

use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array3, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    ensure_input_shape, fingerprint, verify_sidecar_checksum, ActivationSnapshot, Classifier,
    ModelDescriptor,
};
use crate::pipeline::preprocess::{InputSpec, InputTensor};
use crate::pipeline::types::Prediction;
use crate::pipeline::AnalysisError;

const ADAPTER_NAME: &str = "onnx";
const MODEL_FILE: &str = "model.onnx";
const MANIFEST_FILE: &str = "manifest.json";

/// Positions of the three required graph outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLayout {
    pub probability: usize,
    pub activations: usize,
    pub gradients: usize,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            probability: 0,
            activations: 1,
            gradients: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnnxManifest {
    pub name: String,
    pub input: InputSpec,
    pub target_layer: String,
    #[serde(default)]
    pub outputs: OutputLayout,
}

impl OnnxManifest {
    fn validate(&self) -> Result<(), String> {
        self.input.validate()?;
        let o = self.outputs;
        if o.probability == o.activations || o.probability == o.gradients || o.activations == o.gradients {
            return Err(format!("output positions must be distinct, got {o:?}"));
        }
        if self.target_layer.trim().is_empty() {
            return Err("target_layer must be named".into());
        }
        Ok(())
    }
}

/// Classifier backed by an ONNX Runtime session.
///
/// Uses interior mutability (Mutex) because ort::Session::run requires `&mut self`
/// but the Classifier trait exposes `&self` for shared usage.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    manifest: OnnxManifest,
    descriptor: ModelDescriptor,
}

impl OnnxClassifier {
    /// Load `model.onnx` + `manifest.json` from a model directory.
    pub fn load(model_dir: &Path) -> Result<Self, AnalysisError> {
        let model_path = model_dir.join(MODEL_FILE);
        let manifest_path = model_dir.join(MANIFEST_FILE);
        for required in [&model_path, &manifest_path] {
            if !required.exists() {
                return Err(AnalysisError::ModelUnavailable(format!(
                    "missing {}",
                    required.display()
                )));
            }
        }

        let manifest = read_manifest(&manifest_path)?;

        let model_bytes = std::fs::read(&model_path).map_err(|e| {
            AnalysisError::ModelUnavailable(format!("cannot read {}: {e}", model_path.display()))
        })?;
        let digest = fingerprint(&model_bytes);
        verify_sidecar_checksum(&model_path, &digest)?;

        let session = Session::builder()
            .map_err(|e: ort::Error| AnalysisError::ModelUnavailable(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e: ort::Error| AnalysisError::ModelUnavailable(e.to_string()))?
            .commit_from_memory(&model_bytes)
            .map_err(|e: ort::Error| AnalysisError::ModelUnavailable(format!("ONNX load failed: {e}")))?;

        info!(
            dir = %model_dir.display(),
            model = %manifest.name,
            target_layer = %manifest.target_layer,
            "ONNX classifier loaded"
        );

        let descriptor = ModelDescriptor {
            name: manifest.name.clone(),
            adapter: ADAPTER_NAME.into(),
            target_layer: manifest.target_layer.clone(),
            fingerprint: Some(digest),
        };
        Ok(Self {
            session: Mutex::new(session),
            manifest,
            descriptor,
        })
    }

    fn run(&self, input: &InputTensor) -> Result<(f32, Array3<f32>, Array3<f32>), AnalysisError> {
        let batch = input.view().insert_axis(Axis(0)).to_owned();
        let tensor = TensorRef::from_array_view(&batch)
            .map_err(|e| AnalysisError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| AnalysisError::Inference("Session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| AnalysisError::Inference(format!("ONNX inference failed: {e}")))?;

        let layout = self.manifest.outputs;
        let needed = layout.probability.max(layout.activations).max(layout.gradients);
        if outputs.len() <= needed {
            return Err(AnalysisError::Inference(format!(
                "graph produced {} outputs, manifest needs index {needed}",
                outputs.len()
            )));
        }
        let (_, prob) = outputs[layout.probability]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalysisError::Inference(format!("Probability extraction: {e}")))?;
        let probability = match prob {
            [p] => *p,
            other => {
                return Err(AnalysisError::Inference(format!(
                    "probability output has {} values, expected 1",
                    other.len()
                )))
            }
        };

        let activations = extract_feature_map(&outputs[layout.activations], "activation")?;
        let gradients = extract_feature_map(&outputs[layout.gradients], "gradient")?;
        Ok((probability, activations, gradients))
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, input: &InputTensor) -> Result<(Prediction, ActivationSnapshot), AnalysisError> {
        ensure_input_shape(input, &self.manifest.input)?;
        let (probability, activations, gradients) = self.run(input)?;
        let prediction = Prediction::new(probability)?;
        if gradients.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::Inference(format!(
                "{}: graph produced non-finite gradients",
                self.descriptor.name
            )));
        }
        let snapshot = ActivationSnapshot::new(&self.manifest.target_layer, activations, gradients)?;
        debug!(
            model = %self.descriptor.name,
            probability,
            feature_map = format!("{:?}", snapshot.dim()),
            "ONNX inference complete"
        );
        Ok((prediction, snapshot))
    }

    fn input_spec(&self) -> &InputSpec {
        &self.manifest.input
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}

fn read_manifest(path: &Path) -> Result<OnnxManifest, AnalysisError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AnalysisError::ModelUnavailable(format!("cannot read {}: {e}", path.display()))
    })?;
    let manifest: OnnxManifest = serde_json::from_str(&text).map_err(|e| {
        AnalysisError::ModelUnavailable(format!("cannot parse {}: {e}", path.display()))
    })?;
    manifest
        .validate()
        .map_err(|e| AnalysisError::ModelUnavailable(format!("{}: {e}", path.display())))?;
    Ok(manifest)
}

/// `[1, C, H, W]` output → `(C, H, W)`.
fn extract_feature_map(value: &ort::value::DynValue, what: &str) -> Result<Array3<f32>, AnalysisError> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| AnalysisError::Inference(format!("{what} extraction: {e}")))?;
    if shape.len() != 4 || shape[0] != 1 || shape.iter().any(|&d| d <= 0) {
        return Err(AnalysisError::Inference(format!(
            "unexpected {what} shape {shape:?}, expected [1, C, H, W]"
        )));
    }
    let dims = (shape[1] as usize, shape[2] as usize, shape[3] as usize);
    Array3::from_shape_vec(dims, data.to_vec())
        .map_err(|e| AnalysisError::Inference(format!("{what} reshape: {e}")))
}
