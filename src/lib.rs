pub mod config;
pub mod pipeline;

pub use pipeline::{AnalysisError, Analyzer, DecisionRecord, ThresholdPolicy, XrayImage};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (stderr, `RUST_LOG` or the default
/// filter). Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
