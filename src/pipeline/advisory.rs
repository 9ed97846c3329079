//! Clinician-review advisory derived from a decision.
//!
//! Advisory only: never changes the label. Confidence here is confidence in
//! the *reported* label (`p` for Pneumonia, `1 - p` for Normal).

use serde::Serialize;

use super::decision::{confidence_percent, Decision};
use super::explain::SaliencyMap;
use super::types::{Label, Prediction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Confidence above 80%.
    High,
    /// Confidence above 60%.
    Moderate,
    Low,
}

impl RiskLevel {
    fn from_confidence(percent: f32) -> Self {
        if percent > 80.0 {
            RiskLevel::High
        } else if percent > 60.0 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewNotice {
    LowConfidenceNormal,
    UncertainPneumonia,
    BorderlineCase,
    PotentialFalseNegative,
    PolicyOverride,
    NoLocalizedEvidence,
}

impl ReviewNotice {
    pub fn recommendation(self) -> &'static str {
        match self {
            ReviewNotice::LowConfidenceNormal => "Recommend clinical correlation with symptoms",
            ReviewNotice::UncertainPneumonia => "Suggest radiologist review for confirmation",
            ReviewNotice::BorderlineCase => "Consider additional imaging or clinical assessment",
            ReviewNotice::PotentialFalseNegative => "Do not rule out pneumonia based on this read alone",
            ReviewNotice::PolicyOverride => {
                "Label set by the borderline policy, not a high-confidence read"
            }
            ReviewNotice::NoLocalizedEvidence => {
                "Saliency map shows no localized evidence; review the film directly"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewAdvisory {
    pub risk_level: RiskLevel,
    pub notices: Vec<ReviewNotice>,
    pub requires_review: bool,
}

impl ReviewAdvisory {
    pub fn recommendations(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.notices.iter().map(|n| n.recommendation())
    }
}

/// Build the advisory for one decision.
pub fn assess(decision: &Decision, prediction: Prediction, saliency: &SaliencyMap) -> ReviewAdvisory {
    let p = prediction.probability();
    let confidence = confidence_percent(decision.label, p);
    let mut notices = Vec::new();

    match decision.label {
        Label::Normal if confidence < 80.0 => notices.push(ReviewNotice::LowConfidenceNormal),
        Label::Pneumonia if confidence < 70.0 => notices.push(ReviewNotice::UncertainPneumonia),
        _ => {}
    }
    if p > 0.35 && p < 0.65 {
        notices.push(ReviewNotice::BorderlineCase);
    }
    if decision.label == Label::Normal && p > 0.4 && p < 0.6 {
        notices.push(ReviewNotice::PotentialFalseNegative);
    }
    if decision.fallback {
        notices.push(ReviewNotice::PolicyOverride);
    }
    if saliency.is_zero() {
        notices.push(ReviewNotice::NoLocalizedEvidence);
    }

    let risk_level = RiskLevel::from_confidence(confidence);
    ReviewAdvisory {
        requires_review: !notices.is_empty() || risk_level == RiskLevel::Low,
        risk_level,
        notices,
    }
}
