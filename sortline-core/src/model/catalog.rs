//! Known model bundles, keyed by the streaming configuration they were
//! exported for.

use crate::config::StreamingConfig;
use crate::error::{Result, SortlineError};

/// File name of the main model inside every bundle directory.
pub const MODEL_FILE: &str = "model.onnx";
/// Bundle-side copy of the `StreamingConfig` the export expects.
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleSpec {
    pub name: &'static str,
    pub config: StreamingConfig,
}

pub const BUNDLES: &[BundleSpec] = &[
    BundleSpec {
        name: "sortformer-4spk-v2-streaming",
        config: StreamingConfig::sortformer_v2(),
    },
    BundleSpec {
        name: "sortformer-4spk-v2-low-latency",
        config: StreamingConfig::low_latency(),
    },
];

/// Find the bundle exported for exactly `config`.
///
/// # Errors
/// `ModelLoadFailed` when no bundle matches.
pub fn resolve(config: &StreamingConfig) -> Result<&'static BundleSpec> {
    BUNDLES.iter().find(|b| b.config == *config).ok_or_else(|| {
        SortlineError::ModelLoadFailed(format!("no model bundle for configuration {config:?}"))
    })
}
