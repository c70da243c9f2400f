//! Model acquisition: local loading, bundle resolution, remote fetch + cache.
//!
//! ## Lifecycle
//!
//! ```text
//! load(config)                       → local .onnx (file or bundle dir)
//! load_remote(config, cache, units)  → catalog::resolve → cache hit? → download → load
//!     └─► LoadedModel::stream_state() → StreamState ready for run_main_model
//! ```
//!
//! Loading happens once, before streaming starts, and is the only async step.

pub mod cache;
pub mod catalog;

#[cfg(feature = "onnx")]
mod download;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ComputeUnits, StreamingConfig};
use crate::engine::StreamState;
use crate::error::Result;
use crate::inference::{adapter::OutputNames, EngineHandle};

pub use cache::{default_models_dir, BundlePaths};
pub use catalog::{BundleSpec, BUNDLES};

/// Everything needed to obtain an engine for one streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub streaming: StreamingConfig,
    /// `.onnx` file or bundle directory. `None` resolves the bundle for
    /// `streaming` under [`default_models_dir`].
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Defaults to `SORTLINE_ORT_EP` when set, else [`ComputeUnits::All`].
    #[serde(default = "env_compute_units")]
    pub compute_units: ComputeUnits,
    #[serde(default)]
    pub output_names: OutputNames,
    /// Base URL bundles are fetched from; falls back to `SORTLINE_MODEL_BASE_URL`.
    #[serde(default)]
    pub remote_base_url: Option<String>,
}

fn env_compute_units() -> ComputeUnits {
    ComputeUnits::from_env().unwrap_or_default()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            model_path: None,
            compute_units: env_compute_units(),
            output_names: OutputNames::default(),
            remote_base_url: None,
        }
    }
}

impl ModelConfig {
    pub fn new(streaming: StreamingConfig) -> Self {
        Self {
            streaming,
            ..Self::default()
        }
    }

    /// Path of the `.onnx` file this config points at.
    ///
    /// # Errors
    /// `ModelLoadFailed` when no path is set and no bundle matches `streaming`.
    pub fn resolved_model_path(&self) -> Result<PathBuf> {
        match &self.model_path {
            Some(p) if p.is_dir() => Ok(p.join(catalog::MODEL_FILE)),
            Some(p) => Ok(p.clone()),
            None => {
                let bundle = catalog::resolve(&self.streaming)?;
                Ok(BundlePaths::new(&default_models_dir(), bundle).model)
            }
        }
    }

    #[cfg_attr(not(feature = "onnx"), allow(dead_code))]
    fn remote_base_url(&self) -> Option<String> {
        self.remote_base_url
            .clone()
            .or_else(|| std::env::var("SORTLINE_MODEL_BASE_URL").ok())
            .filter(|u| !u.trim().is_empty())
    }
}

/// A ready engine plus how long it took to obtain.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub engine: EngineHandle,
    pub load_duration: Duration,
    pub model_path: PathBuf,
    pub output_names: OutputNames,
}

impl LoadedModel {
    /// A fresh streaming container sharing this model's engine.
    pub fn stream_state(&self, config: StreamingConfig) -> Result<StreamState> {
        Ok(StreamState::new(config, self.engine.clone())?
            .with_output_names(self.output_names.clone()))
    }
}

#[cfg(feature = "onnx")]
pub use onnx_loader::{load, load_remote};

#[cfg(feature = "onnx")]
mod onnx_loader {
    use std::path::Path;
    use std::time::Instant;

    use tracing::info;

    use super::{cache, catalog, download, BundlePaths, LoadedModel, ModelConfig};
    use crate::config::ComputeUnits;
    use crate::error::{Result, SortlineError};
    use crate::inference::{EngineHandle, OnnxEngine};

    /// Load the model `config` points at from local disk.
    ///
    /// # Errors
    /// `ModelLoadFailed` for a missing file, a bundle exported for another
    /// configuration, or a session that cannot be built.
    pub fn load(config: &ModelConfig) -> Result<LoadedModel> {
        let started = Instant::now();
        let model_path = config.resolved_model_path()?;
        cache::check_bundle_config(&model_path, &config.streaming)?;

        let engine = OnnxEngine::new(&model_path, config.compute_units)?;
        let load_duration = started.elapsed();
        info!(
            path = ?model_path,
            load_ms = load_duration.as_secs_f64() * 1_000.0,
            "main model loaded"
        );
        Ok(LoadedModel {
            engine: EngineHandle::new(engine),
            load_duration,
            model_path,
            output_names: config.output_names.clone(),
        })
    }

    /// Resolve the bundle for `config.streaming`, reuse a verified copy under
    /// `cache_dir` or download it, then load it with `compute_units`.
    ///
    /// `compute_units` replaces `config.compute_units`, and `SORTLINE_ORT_EP`
    /// is not consulted.
    ///
    /// # Errors
    /// `ModelLoadFailed` when no bundle matches, nothing is cached and no remote
    /// source is configured, or the download / session build fails.
    pub async fn load_remote(
        config: &ModelConfig,
        cache_dir: impl AsRef<Path>,
        compute_units: ComputeUnits,
    ) -> Result<LoadedModel> {
        let bundle = catalog::resolve(&config.streaming)?;
        let paths = BundlePaths::new(cache_dir.as_ref(), bundle);
        let base_url = config.remote_base_url();

        let mut local = config.clone();
        local.model_path = Some(paths.model.clone());
        local.compute_units = compute_units;

        tokio::task::spawn_blocking(move || -> Result<LoadedModel> {
            let started = Instant::now();
            if cache::is_cached(&paths)? {
                info!(bundle = bundle.name, "using cached model bundle");
            } else {
                let base_url = base_url.ok_or_else(|| {
                    SortlineError::ModelLoadFailed(format!(
                        "bundle {} is not cached and no remote source is configured \
                         (set SORTLINE_MODEL_BASE_URL)",
                        bundle.name
                    ))
                })?;
                download::fetch(&base_url, bundle, &paths.model)?;
                cache::record(&paths, &bundle.config)?;
            }
            let mut loaded = load(&local)?;
            loaded.load_duration = started.elapsed();
            Ok(loaded)
        })
        .await
        .map_err(|e| SortlineError::ModelLoadFailed(format!("loader task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::EchoEngine;

    #[test]
    fn explicit_file_path_is_used_verbatim() {
        let mut cfg = ModelConfig::new(StreamingConfig::low_latency());
        cfg.model_path = Some(PathBuf::from("/models/custom.onnx"));
        assert_eq!(
            cfg.resolved_model_path().unwrap(),
            PathBuf::from("/models/custom.onnx")
        );
    }

    #[test]
    fn unset_path_resolves_catalog_bundle() {
        let cfg = ModelConfig::new(StreamingConfig::low_latency());
        let path = cfg.resolved_model_path().unwrap();
        assert!(path.ends_with("sortformer-4spk-v2-low-latency/model.onnx"));
    }

    #[test]
    fn unset_path_without_bundle_fails() {
        let mut streaming = StreamingConfig::low_latency();
        streaming.embedding_dims = 3;
        assert!(ModelConfig::new(streaming).resolved_model_path().is_err());
    }

    #[test]
    fn model_config_parses_with_defaults() {
        let raw = r#"{"streaming":{"chunk_frames":112,"mel_features":128,"fifo_capacity":188,
                      "spkcache_capacity":188,"embedding_dims":512},
                      "compute_units":"cpu_only"}"#;
        let cfg: ModelConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.compute_units, ComputeUnits::CpuOnly);
        assert_eq!(cfg.output_names, OutputNames::default());
        assert!(cfg.model_path.is_none());
    }

    #[test]
    fn loaded_model_builds_stream_states_sharing_engine() {
        let loaded = LoadedModel {
            engine: EngineHandle::new(EchoEngine::new(4)),
            load_duration: Duration::ZERO,
            model_path: PathBuf::from("echo"),
            output_names: OutputNames::default(),
        };
        let a = loaded.stream_state(StreamingConfig::low_latency()).unwrap();
        let b = loaded.stream_state(StreamingConfig::low_latency()).unwrap();
        assert_eq!(a.config(), b.config());
    }
}
