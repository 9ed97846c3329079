//! Analysis orchestrator.
//!
//! Single entry point that drives one radiograph through the pipeline:
//! prepare → exposure check → predict → explain → decide → advisory → record.
//!
//! Uses trait-based DI for every stage (Preprocessor, Classifier, Explainer,
//! ExposureAssessor) so the orchestrator stays testable with scripted
//! implementations. The first stage error aborts the call and is returned
//! unchanged; a partial record is never built.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::advisory;
use super::classifier::{load_classifier, Classifier};
use super::decision::{confidence_percent, decide, ThresholdPolicy};
use super::enhance::ContrastEnhancer;
use super::explain::{Explainer, GradCamExplainer};
use super::preprocess::{Preprocessor, StandardPreprocessor};
use super::quality::{ExposureAssessor, HistogramExposureAssessor};
use super::types::DecisionRecord;
use super::xray::XrayImage;
use super::AnalysisError;
use crate::config::AnalyzerConfig;

/// Runs `analyze` calls against one loaded model.
///
/// Immutable after construction; share it behind an `Arc` for concurrent use.
pub struct Analyzer {
    preprocessor: Box<dyn Preprocessor>,
    classifier: Arc<dyn Classifier>,
    explainer: Box<dyn Explainer>,
    exposure: Box<dyn ExposureAssessor>,
}

impl Analyzer {
    pub fn new(
        preprocessor: Box<dyn Preprocessor>,
        classifier: Arc<dyn Classifier>,
        explainer: Box<dyn Explainer>,
        exposure: Box<dyn ExposureAssessor>,
    ) -> Self {
        Self {
            preprocessor,
            classifier,
            explainer,
            exposure,
        }
    }

    /// Standard stages around `classifier`, preprocessing to its input spec.
    pub fn with_classifier(classifier: Arc<dyn Classifier>) -> Self {
        let preprocessor = StandardPreprocessor::new(classifier.input_spec().clone());
        Self::new(
            Box::new(preprocessor),
            classifier,
            Box::new(GradCamExplainer),
            Box::new(HistogramExposureAssessor),
        )
    }

    /// Load the configured model and build the standard pipeline around it.
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self, AnalysisError> {
        let model_path = config.resolve_model_path()?;
        let classifier = load_classifier(&model_path)?;
        let mut preprocessor = StandardPreprocessor::new(classifier.input_spec().clone());
        if config.enhance_contrast {
            preprocessor = preprocessor.with_contrast_enhancement(ContrastEnhancer::default());
        }
        Ok(Self::new(
            Box::new(preprocessor),
            classifier,
            Box::new(GradCamExplainer),
            Box::new(HistogramExposureAssessor),
        ))
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    /// Classify, explain and decide for one image.
    pub fn analyze(
        &self,
        image: &XrayImage,
        policy: &ThresholdPolicy,
    ) -> Result<DecisionRecord, AnalysisError> {
        let started = Instant::now();
        let id = Uuid::new_v4();

        // Step 1: Preprocess (validates the image)
        let tensor = self.preprocessor.prepare(image)?;

        // Step 2: Exposure check (advisory only)
        let exposure = self.exposure.assess(image);
        if !exposure.warnings.is_empty() {
            warn!(id = %id, warnings = ?exposure.warnings, "Exposure quality warnings");
        }

        // Step 3: Forward + backward in one call
        let (prediction, snapshot) = self.classifier.predict(&tensor)?;

        // Step 4: Saliency at source resolution
        let saliency = self.explainer.explain(
            snapshot,
            image.height() as usize,
            image.width() as usize,
        )?;

        // Step 5: Calibrated decision
        let decision = decide(prediction, policy);
        let advisory = advisory::assess(&decision, prediction, &saliency);

        let probability = prediction.probability();
        info!(
            id = %id,
            label = %decision.label,
            probability,
            band = ?decision.band,
            fallback = decision.fallback,
            requires_review = advisory.requires_review,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Analysis complete"
        );

        Ok(DecisionRecord {
            id,
            created_at: Utc::now(),
            label: decision.label,
            probability,
            confidence_percent: confidence_percent(decision.label, probability),
            band: decision.band,
            fallback: decision.fallback,
            policy: policy.clone(),
            saliency,
            advisory,
            warnings: exposure.warnings,
            model: self.classifier.descriptor().clone(),
        })
    }

    /// `analyze` on tokio's blocking pool.
    ///
    /// Wrap in `tokio::time::timeout` for a deadline; the blocking task runs
    /// to completion either way and its result is dropped.
    pub async fn analyze_async(
        self: Arc<Self>,
        image: XrayImage,
        policy: ThresholdPolicy,
    ) -> Result<DecisionRecord, AnalysisError> {
        tokio::task::spawn_blocking(move || self.analyze(&image, &policy))
            .await
            .map_err(|e| AnalysisError::Inference(format!("analysis task failed: {e}")))?
    }

    /// Analyze several images concurrently. One result per image, in input order.
    pub async fn analyze_many(
        self: Arc<Self>,
        images: Vec<XrayImage>,
        policy: &ThresholdPolicy,
    ) -> Vec<Result<DecisionRecord, AnalysisError>> {
        let handles: Vec<_> = images
            .into_iter()
            .map(|image| tokio::spawn(Arc::clone(&self).analyze_async(image, policy.clone())))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(AnalysisError::Inference(format!("analysis task failed: {e}"))),
            });
        }
        results
    }
}
