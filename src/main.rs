use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use pneumoscope::config::{self, AnalyzerConfig};
use pneumoscope::pipeline::classifier::{load_classifier, ModelDescriptor};
use pneumoscope::pipeline::decision::PolicyPreset;
use pneumoscope::pipeline::overlay::{encode_png, render_overlay};
use pneumoscope::pipeline::preprocess::InputSpec;
use pneumoscope::{AnalysisError, Analyzer, XrayImage};

#[derive(Parser)]
#[command(name = "pneumoscope", version, about = "Chest X-ray pneumonia screening with Grad-CAM explanations")]
struct Cli {
    /// JSON configuration file (default: $PNEUMOSCOPE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one radiograph and print the decision record as JSON
    Analyze {
        /// PNG, JPEG or TIFF radiograph
        image: PathBuf,
        /// Model artifact (`.json`) or ONNX model directory
        #[arg(long)]
        model: Option<PathBuf>,
        /// conservative, balanced or strict; replaces any configured policy
        #[arg(long)]
        preset: Option<PolicyPreset>,
        /// Write the saliency overlay PNG here
        #[arg(long)]
        overlay: Option<PathBuf>,
        /// Include the full saliency grid in the JSON output
        #[arg(long)]
        include_map: bool,
        /// Apply CLAHE contrast enhancement before classification
        #[arg(long)]
        enhance_contrast: bool,
    },
    /// Load a model and print its descriptor and input contract
    InspectModel {
        /// Model artifact (`.json`) or ONNX model directory
        model: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    pneumoscope::init_tracing();
    let cli = Cli::parse();
    tracing::debug!("{} v{}", config::APP_NAME, config::APP_VERSION);

    let result = match cli.command {
        Commands::Analyze {
            image,
            model,
            preset,
            overlay,
            include_map,
            enhance_contrast,
        } => {
            let overrides = AnalyzeOverrides {
                model,
                preset,
                enhance_contrast,
            };
            run_analyze(cli.config.as_deref(), &image, overrides, overlay.as_deref(), include_map).await
        }
        Commands::InspectModel { model } => run_inspect(&model),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

struct AnalyzeOverrides {
    model: Option<PathBuf>,
    preset: Option<PolicyPreset>,
    enhance_contrast: bool,
}

fn load_config(path: Option<&Path>) -> Result<AnalyzerConfig, AnalysisError> {
    match path {
        Some(path) => Ok(AnalyzerConfig::load(path)?.with_env_overrides(|k| std::env::var(k).ok())),
        None => AnalyzerConfig::from_env(),
    }
}

async fn run_analyze(
    config_path: Option<&Path>,
    image_path: &Path,
    overrides: AnalyzeOverrides,
    overlay: Option<&Path>,
    include_map: bool,
) -> Result<(), AnalysisError> {
    let mut config = load_config(config_path)?;
    if let Some(model) = overrides.model {
        config.model_path = Some(model);
    }
    if let Some(preset) = overrides.preset {
        config.preset = preset;
        config.policy = None;
    }
    config.enhance_contrast |= overrides.enhance_contrast;

    // Policy errors surface before the model is loaded.
    let policy = config.threshold_policy()?;
    let analyzer = Arc::new(Analyzer::from_config(&config)?);
    let image = XrayImage::open(image_path)?;

    let record = Arc::clone(&analyzer).analyze_async(image.clone(), policy).await?;

    if let Some(path) = overlay {
        let rendered = render_overlay(&image, &record.saliency, config.overlay_alpha)?;
        std::fs::write(path, encode_png(&rendered)?)?;
        tracing::info!(path = %path.display(), "Overlay written");
    }

    let mut output = serde_json::to_value(&record)?;
    if !include_map {
        if let Some(saliency) = output.get_mut("saliency").and_then(|s| s.as_object_mut()) {
            saliency.remove("values");
        }
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[derive(Serialize)]
struct ModelReport<'a> {
    descriptor: &'a ModelDescriptor,
    input: &'a InputSpec,
}

fn run_inspect(model: &Path) -> Result<(), AnalysisError> {
    let classifier = load_classifier(model)?;
    let report = ModelReport {
        descriptor: classifier.descriptor(),
        input: classifier.input_spec(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn exit_code(err: &AnalysisError) -> u8 {
    match err {
        AnalysisError::InvalidImage(_) => 2,
        AnalysisError::ModelUnavailable(_) => 3,
        AnalysisError::InvalidPolicy(_) | AnalysisError::Config(_) => 4,
        _ => 1,
    }
}
