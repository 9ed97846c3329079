//! Decision calibration: probability → clinical label.
//!
//! The probability axis is split into three regions by `[t_low, t_high]`:
//!
//! ```text
//!   0 ──── t_low ────────── t_high ──── 1
//!   Normal │   Borderline   │ Pneumonia
//!   (high confidence)  (policy-driven)  (high confidence)
//! ```
//!
//! Only the borderline band is subject to false-negative mitigation; reads
//! outside it are never overridden. `decide` is a pure function of its inputs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::{CalibrationBand, Label, Prediction};
use super::AnalysisError;

// ═══════════════════════════════════════════════════════════
// Borderline bias
// ═══════════════════════════════════════════════════════════

/// How a borderline probability is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BorderlineBias {
    /// Every borderline case is labelled Pneumonia.
    #[default]
    FavorSensitivity,
    /// Pneumonia iff the expected cost of missing it is at least the
    /// expected cost of a false alarm: `p * fn_cost >= (1 - p) * fp_cost`.
    CostWeighted {
        false_negative_cost: f32,
        false_positive_cost: f32,
    },
    /// Pneumonia iff `p >= threshold`.
    Threshold,
}

// ═══════════════════════════════════════════════════════════
// ThresholdPolicy
// ═══════════════════════════════════════════════════════════

/// Unvalidated policy, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub t_low: f32,
    pub t_high: f32,
    /// Primary threshold; defaults to the band midpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub bias: BorderlineBias,
}

/// Validated, immutable decision policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicySettings", into = "PolicySettings")]
pub struct ThresholdPolicy {
    t_low: f32,
    t_high: f32,
    threshold: f32,
    bias: BorderlineBias,
}

impl ThresholdPolicy {
    /// Band `[t_low, t_high]`; primary threshold at the band midpoint.
    pub fn new(t_low: f32, t_high: f32, bias: BorderlineBias) -> Result<Self, AnalysisError> {
        Self::with_threshold(t_low, t_high, midpoint(t_low, t_high), bias)
    }

    /// The threshold is only consulted for borderline reads under
    /// `BorderlineBias::Threshold`, so it may lie outside the band.
    pub fn with_threshold(
        t_low: f32,
        t_high: f32,
        threshold: f32,
        bias: BorderlineBias,
    ) -> Result<Self, AnalysisError> {
        let invalid = |msg: String| Err(AnalysisError::InvalidPolicy(msg));

        if ![t_low, t_high, threshold].iter().all(|v| v.is_finite()) {
            return invalid(format!(
                "non-finite value in t_low={t_low}, t_high={t_high}, threshold={threshold}"
            ));
        }
        if !(0.0 <= t_low && t_low <= t_high && t_high <= 1.0) {
            return invalid(format!(
                "band must satisfy 0 <= t_low <= t_high <= 1, got [{t_low}, {t_high}]"
            ));
        }
        if !(threshold > 0.0 && threshold < 1.0) {
            return invalid(format!("threshold must lie in (0, 1), got {threshold}"));
        }
        if let BorderlineBias::CostWeighted {
            false_negative_cost,
            false_positive_cost,
        } = bias
        {
            let valid = |c: f32| c.is_finite() && c > 0.0;
            if !valid(false_negative_cost) || !valid(false_positive_cost) {
                return invalid(format!(
                    "costs must be finite and positive, got fn={false_negative_cost}, fp={false_positive_cost}"
                ));
            }
        }

        Ok(Self {
            t_low,
            t_high,
            threshold,
            bias,
        })
    }

    pub fn preset(preset: PolicyPreset) -> Self {
        let (t_low, t_high, threshold) = preset.parameters();
        Self {
            t_low,
            t_high,
            threshold,
            bias: BorderlineBias::FavorSensitivity,
        }
    }

    pub fn t_low(&self) -> f32 {
        self.t_low
    }

    pub fn t_high(&self) -> f32 {
        self.t_high
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn bias(&self) -> BorderlineBias {
        self.bias
    }

    /// Region of the probability axis `p` falls into.
    pub fn band_for(&self, p: f32) -> CalibrationBand {
        if p >= self.t_high {
            CalibrationBand::HighConfidencePositive
        } else if p <= self.t_low {
            CalibrationBand::HighConfidenceNegative
        } else {
            CalibrationBand::Borderline
        }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::preset(PolicyPreset::default())
    }
}

impl TryFrom<PolicySettings> for ThresholdPolicy {
    type Error = AnalysisError;

    fn try_from(s: PolicySettings) -> Result<Self, Self::Error> {
        let threshold = s.threshold.unwrap_or_else(|| midpoint(s.t_low, s.t_high));
        Self::with_threshold(s.t_low, s.t_high, threshold, s.bias)
    }
}

impl From<ThresholdPolicy> for PolicySettings {
    fn from(p: ThresholdPolicy) -> Self {
        Self {
            t_low: p.t_low,
            t_high: p.t_high,
            threshold: Some(p.threshold),
            bias: p.bias,
        }
    }
}

fn midpoint(t_low: f32, t_high: f32) -> f32 {
    ((t_low + t_high) / 2.0).clamp(f32::EPSILON, 1.0 - f32::EPSILON)
}

// ═══════════════════════════════════════════════════════════
// Presets
// ═══════════════════════════════════════════════════════════

/// Named sensitivity settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPreset {
    /// Lowest threshold, most sensitive.
    Conservative,
    #[default]
    Balanced,
    Strict,
}

impl PolicyPreset {
    /// `(t_low, t_high, threshold)`.
    fn parameters(self) -> (f32, f32, f32) {
        match self {
            PolicyPreset::Conservative => (0.2, 0.4, 0.3),
            PolicyPreset::Balanced => (0.35, 0.65, 0.4),
            PolicyPreset::Strict => (0.4, 0.6, 0.5),
        }
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyPreset::Conservative => write!(f, "conservative"),
            PolicyPreset::Balanced => write!(f, "balanced"),
            PolicyPreset::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for PolicyPreset {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(PolicyPreset::Conservative),
            "balanced" => Ok(PolicyPreset::Balanced),
            "strict" => Ok(PolicyPreset::Strict),
            other => Err(AnalysisError::InvalidPolicy(format!(
                "unknown preset '{other}' (expected conservative, balanced or strict)"
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub label: Label,
    pub band: CalibrationBand,
    /// True when the label came from the borderline rule.
    pub fallback: bool,
}

/// Map a probability to a label under `policy`.
pub fn decide(prediction: Prediction, policy: &ThresholdPolicy) -> Decision {
    let p = prediction.probability();
    match policy.band_for(p) {
        band @ CalibrationBand::HighConfidencePositive => Decision {
            label: Label::Pneumonia,
            band,
            fallback: false,
        },
        band @ CalibrationBand::HighConfidenceNegative => Decision {
            label: Label::Normal,
            band,
            fallback: false,
        },
        band @ CalibrationBand::Borderline => Decision {
            label: resolve_borderline(p, policy),
            band,
            fallback: true,
        },
    }
}

fn resolve_borderline(p: f32, policy: &ThresholdPolicy) -> Label {
    let positive = match policy.bias {
        BorderlineBias::FavorSensitivity => true,
        BorderlineBias::CostWeighted {
            false_negative_cost,
            false_positive_cost,
        } => p * false_negative_cost >= (1.0 - p) * false_positive_cost,
        BorderlineBias::Threshold => p >= policy.threshold,
    };
    if positive {
        Label::Pneumonia
    } else {
        Label::Normal
    }
}

/// Confidence in the reported label, 0-100.
pub fn confidence_percent(label: Label, p: f32) -> f32 {
    match label {
        Label::Pneumonia => p * 100.0,
        Label::Normal => (1.0 - p) * 100.0,
    }
}
