//! Exposure quality checks on the raw radiograph.
//!
//! Pure read-only analysis. Warnings are attached to the decision record but
//! never block analysis: the clinician still gets a read, flagged.

use serde::{Deserialize, Serialize};

use super::xray::XrayImage;

/// Fraction of samples below `DARK_LEVEL` that marks the film as underexposed.
const DARK_RATIO_LIMIT: f32 = 0.80;
const DARK_LEVEL: f32 = 0.06;

/// Fraction of samples above `BRIGHT_LEVEL` that marks the film as blown out.
const BRIGHT_RATIO_LIMIT: f32 = 0.80;
const BRIGHT_LEVEL: f32 = 0.94;

/// RMS contrast (unit scale) below this = nearly uniform film.
const CONTRAST_LIMIT: f32 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageWarning {
    Underexposed { dark_ratio: f32 },
    Overexposed { bright_ratio: f32 },
    LowContrast { rms_contrast: f32 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExposureReport {
    pub warnings: Vec<ImageWarning>,
    pub dark_ratio: f32,
    pub bright_ratio: f32,
    pub rms_contrast: f32,
}

pub trait ExposureAssessor: Send + Sync {
    fn assess(&self, image: &XrayImage) -> ExposureReport;
}

/// Histogram-based exposure checks on the luma plane.
pub struct HistogramExposureAssessor;

impl ExposureAssessor for HistogramExposureAssessor {
    fn assess(&self, image: &XrayImage) -> ExposureReport {
        let gray = image.to_unit_gray();
        let mut report = ExposureReport::default();
        if gray.is_empty() || gray.iter().any(|v| !v.is_finite()) {
            return report;
        }
        let n = gray.len() as f32;

        report.dark_ratio = gray.iter().filter(|&&v| v < DARK_LEVEL).count() as f32 / n;
        report.bright_ratio = gray.iter().filter(|&&v| v > BRIGHT_LEVEL).count() as f32 / n;

        let mean = gray.iter().sum::<f32>() / n;
        let variance = gray.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        report.rms_contrast = variance.sqrt();

        if report.dark_ratio > DARK_RATIO_LIMIT {
            report.warnings.push(ImageWarning::Underexposed {
                dark_ratio: report.dark_ratio,
            });
        }
        if report.bright_ratio > BRIGHT_RATIO_LIMIT {
            report.warnings.push(ImageWarning::Overexposed {
                bright_ratio: report.bright_ratio,
            });
        }
        // Uniformly dark/bright films already carry a more specific warning.
        if report.rms_contrast < CONTRAST_LIMIT && report.warnings.is_empty() {
            report.warnings.push(ImageWarning::LowContrast {
                rms_contrast: report.rms_contrast,
            });
        }
        report
    }
}
