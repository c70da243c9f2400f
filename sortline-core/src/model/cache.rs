//! On-disk bundle layout and integrity sidecars.
//!
//! ```text
//! <cache_dir>/<bundle>/model.onnx
//! <cache_dir>/<bundle>/model.onnx.sha256
//! <cache_dir>/<bundle>/config.json
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::catalog::{BundleSpec, CONFIG_FILE, MODEL_FILE};
use crate::config::StreamingConfig;
use crate::error::{Result, SortlineError};

fn io_err(path: &Path, e: std::io::Error) -> SortlineError {
    SortlineError::ModelLoadFailed(format!("{}: {e}", path.display()))
}

/// Default models directory: `SORTLINE_MODEL_DIR`, else the platform data dir.
pub fn default_models_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var("SORTLINE_MODEL_DIR") {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit.trim());
        }
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Lattice Labs").join("Sortline").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("sortline")
            .join("models")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub dir: PathBuf,
    pub model: PathBuf,
    pub checksum: PathBuf,
    pub config: PathBuf,
}

impl BundlePaths {
    pub fn new(cache_dir: &Path, bundle: &BundleSpec) -> Self {
        Self::in_dir(cache_dir.join(bundle.name))
    }

    pub fn in_dir(dir: PathBuf) -> Self {
        Self {
            model: dir.join(MODEL_FILE),
            checksum: dir.join(format!("{MODEL_FILE}.sha256")),
            config: dir.join(CONFIG_FILE),
            dir,
        }
    }
}

/// Hex SHA-256 of a file, streamed in 64 KiB blocks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut block).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// `true` when the model and its sidecar exist and the digest still matches.
pub fn is_cached(paths: &BundlePaths) -> Result<bool> {
    if !paths.model.exists() || !paths.checksum.exists() {
        return Ok(false);
    }
    let expected = std::fs::read_to_string(&paths.checksum)
        .map_err(|e| io_err(&paths.checksum, e))?;
    let actual = sha256_file(&paths.model)?;
    if expected.trim() != actual {
        warn!(model = ?paths.model, "cached model digest mismatch; refetching");
        return Ok(false);
    }
    Ok(true)
}

/// Write the digest sidecar and the bundle's `config.json`.
pub fn record(paths: &BundlePaths, config: &StreamingConfig) -> Result<()> {
    let digest = sha256_file(&paths.model)?;
    std::fs::write(&paths.checksum, &digest).map_err(|e| io_err(&paths.checksum, e))?;
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| SortlineError::ModelLoadFailed(e.to_string()))?;
    std::fs::write(&paths.config, json).map_err(|e| io_err(&paths.config, e))?;
    info!(dir = ?paths.dir, sha256 = %digest, "bundle recorded in cache");
    Ok(())
}

/// Reject a model whose sibling `config.json` disagrees with `expected`.
/// A bundle without `config.json` is accepted as-is.
pub fn check_bundle_config(model: &Path, expected: &StreamingConfig) -> Result<()> {
    let Some(sidecar) = model.parent().map(|dir| dir.join(CONFIG_FILE)) else {
        return Ok(());
    };
    if !sidecar.exists() {
        return Ok(());
    }
    let found = StreamingConfig::from_json_file(&sidecar)?;
    if found != *expected {
        return Err(SortlineError::ModelLoadFailed(format!(
            "bundle at {} was exported for {found:?}, requested {expected:?}",
            sidecar.display()
        )));
    }
    Ok(())
}
