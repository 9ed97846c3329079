//! Chest X-ray analysis pipeline.
//!
//! Stage order for one `analyze` call:
//! image → preprocess → classifier (forward + backward) → explain → decide → record.
//!
//! Every stage reports failures through [`AnalysisError`]; the orchestrator
//! surfaces the first failure unchanged and never assembles a partial record.

pub mod xray;
pub mod resample;
pub mod enhance;
pub mod quality;
pub mod preprocess;
pub mod classifier;
pub mod explain;
pub mod decision;
pub mod advisory;
pub mod overlay;
pub mod types;
pub mod orchestrator;

pub use xray::{ValueRange, XrayImage};
pub use preprocess::{InputScale, InputSpec, InputTensor, Preprocessor, StandardPreprocessor};
pub use classifier::{ActivationSnapshot, Classifier, ModelDescriptor};
pub use explain::{Explainer, GradCamExplainer, SaliencyMap};
pub use decision::{decide, BorderlineBias, Decision, PolicyPreset, PolicySettings, ThresholdPolicy};
pub use advisory::{ReviewAdvisory, ReviewNotice, RiskLevel};
pub use types::{CalibrationBand, DecisionRecord, Label, Prediction};
pub use orchestrator::Analyzer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Malformed or empty input image. Not recoverable locally.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Trained parameters missing, unreadable or corrupt.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Forward or backward pass could not complete for one input.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Threshold configuration rejected at construction.
    #[error("Invalid threshold policy: {0}")]
    InvalidPolicy(String),

    #[error("Overlay rendering failed: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
