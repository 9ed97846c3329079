use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::advisory::ReviewAdvisory;
use super::classifier::ModelDescriptor;
use super::decision::ThresholdPolicy;
use super::explain::SaliencyMap;
use super::quality::ImageWarning;
use super::AnalysisError;

/// Clinical label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Normal,
    Pneumonia,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Normal => write!(f, "Normal"),
            Label::Pneumonia => write!(f, "Pneumonia"),
        }
    }
}

/// Region of the probability axis a decision fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationBand {
    HighConfidencePositive,
    HighConfidenceNegative,
    Borderline,
}

/// Positive-class (Pneumonia) probability from one classifier invocation.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Prediction(f32);

impl Prediction {
    /// Fails with `Inference` for NaN, infinities or values outside [0, 1].
    pub fn new(probability: f32) -> Result<Self, AnalysisError> {
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(AnalysisError::Inference(format!(
                "classifier produced probability {probability} outside [0, 1]"
            )));
        }
        Ok(Self(probability))
    }

    pub fn probability(self) -> f32 {
        self.0
    }
}

/// Final output of one `analyze` call. Owned by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub label: Label,
    pub probability: f32,
    /// Confidence in the reported label, 0-100.
    pub confidence_percent: f32,
    pub band: CalibrationBand,
    /// Set when the label came from the borderline policy rather than a
    /// high-confidence read.
    pub fallback: bool,
    pub policy: ThresholdPolicy,
    pub saliency: SaliencyMap,
    pub advisory: ReviewAdvisory,
    pub warnings: Vec<ImageWarning>,
    pub model: ModelDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_accepts_unit_interval_bounds() {
        assert_eq!(Prediction::new(0.0).unwrap().probability(), 0.0);
        assert_eq!(Prediction::new(1.0).unwrap().probability(), 1.0);
    }

    #[test]
    fn prediction_rejects_out_of_range_and_nan() {
        for bad in [-0.01, 1.01, f32::NAN, f32::INFINITY] {
            assert!(matches!(Prediction::new(bad), Err(AnalysisError::Inference(_))));
        }
    }

    #[test]
    fn label_serializes_as_clinical_name() {
        assert_eq!(serde_json::to_string(&Label::Pneumonia).unwrap(), "\"Pneumonia\"");
        assert_eq!(Label::Normal.to_string(), "Normal");
    }

    #[test]
    fn band_serializes_snake_case() {
        let json = serde_json::to_string(&CalibrationBand::HighConfidencePositive).unwrap();
        assert_eq!(json, "\"high_confidence_positive\"");
    }
}
