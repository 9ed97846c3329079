use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::decision::{PolicyPreset, PolicySettings, ThresholdPolicy};
use crate::pipeline::overlay::DEFAULT_OVERLAY_ALPHA;
use crate::pipeline::AnalysisError;

/// Application-level constants
pub const APP_NAME: &str = "Pneumoscope";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path of a JSON `AnalyzerConfig` file.
pub const CONFIG_ENV: &str = "PNEUMOSCOPE_CONFIG";
/// Model artifact path; overrides the config file's `model_path`.
pub const MODEL_ENV: &str = "PNEUMOSCOPE_MODEL";

const DEFAULT_MODEL_FILE: &str = "pneumonia-convnet.json";

/// Get the application data directory (`~/Pneumoscope/`).
/// `None` when the home directory cannot be determined.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_NAME))
}

/// Get the models directory
pub fn models_dir() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join("models"))
}

/// Model used when neither the config nor the environment names one.
pub fn default_model_path() -> Option<PathBuf> {
    models_dir().map(|dir| dir.join(DEFAULT_MODEL_FILE))
}

/// Tracing filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "pneumoscope=debug,info"
    } else {
        "pneumoscope=info,warn"
    }
}

// ═══════════════════════════════════════════════════════════
// AnalyzerConfig
// ═══════════════════════════════════════════════════════════

/// Operator-tunable settings. Every field has a default, so `{}` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub model_path: Option<PathBuf>,
    /// Named policy; ignored when `policy` is set.
    pub preset: PolicyPreset,
    /// Explicit band/threshold/bias, validated when the policy is built.
    pub policy: Option<PolicySettings>,
    pub enhance_contrast: bool,
    pub overlay_alpha: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            preset: PolicyPreset::default(),
            policy: None,
            enhance_contrast: false,
            overlay_alpha: DEFAULT_OVERLAY_ALPHA,
        }
    }
}

impl AnalyzerConfig {
    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AnalysisError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| AnalysisError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Config from `PNEUMOSCOPE_CONFIG` (or defaults), then env overrides.
    pub fn from_env() -> Result<Self, AnalysisError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let base = match lookup(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        Ok(base.with_env_overrides(lookup))
    }

    /// Apply `PNEUMOSCOPE_MODEL` from `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(model) = lookup(MODEL_ENV).filter(|m| !m.trim().is_empty()) {
            self.model_path = Some(PathBuf::from(model));
        }
        self
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !(0.0..=1.0).contains(&self.overlay_alpha) {
            return Err(AnalysisError::Config(format!(
                "overlay_alpha must lie in [0, 1], got {}",
                self.overlay_alpha
            )));
        }
        Ok(())
    }

    /// Explicit policy if present, else the preset.
    pub fn threshold_policy(&self) -> Result<ThresholdPolicy, AnalysisError> {
        match &self.policy {
            Some(settings) => ThresholdPolicy::try_from(settings.clone()),
            None => Ok(ThresholdPolicy::preset(self.preset)),
        }
    }

    /// Configured model, falling back to `~/Pneumoscope/models/`.
    pub fn resolve_model_path(&self) -> Result<PathBuf, AnalysisError> {
        self.model_path
            .clone()
            .or_else(default_model_path)
            .ok_or_else(|| {
                AnalysisError::ModelUnavailable(format!(
                    "no model configured; set {MODEL_ENV} or model_path"
                ))
            })
    }
}
