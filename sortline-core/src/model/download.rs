//! Blocking bundle download. Runs inside `spawn_blocking` (see `load_remote`).

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::catalog::{BundleSpec, MODEL_FILE};
use crate::error::{Result, SortlineError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn fetch_err(e: impl std::fmt::Display) -> SortlineError {
    SortlineError::ModelLoadFailed(format!("download failed: {e}"))
}

pub(crate) fn bundle_url(base_url: &str, bundle: &BundleSpec) -> String {
    format!(
        "{}/{}/{}",
        base_url.trim_end_matches('/'),
        bundle.name,
        MODEL_FILE
    )
}

/// Stream `bundle`'s model into `dest` via a `.part` file, renamed on success.
pub(crate) fn fetch(base_url: &str, bundle: &BundleSpec, dest: &Path) -> Result<()> {
    let url = bundle_url(base_url, bundle);
    if let Some(dir) = dest.parent() {
        std::fs::create_dir_all(dir).map_err(fetch_err)?;
    }
    let partial = dest.with_extension("onnx.part");

    info!(%url, dest = ?dest, "downloading model bundle");
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None::<Duration>)
        .build()
        .map_err(fetch_err)?;
    let mut response = client
        .get(&url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(fetch_err)?;

    let bytes = persist(&mut response, &partial, dest)?;
    info!(bytes, "model bundle downloaded");
    Ok(())
}

/// Write `body` to `partial`, then rename it to `dest`. A failed write or
/// rename removes `partial`.
fn persist(body: &mut impl Read, partial: &Path, dest: &Path) -> Result<u64> {
    let written = (|| -> std::io::Result<u64> {
        let mut file = File::create(partial)?;
        let bytes = std::io::copy(body, &mut file)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(partial, dest)?;
        Ok(bytes)
    })();
    written.map_err(|e| {
        if let Err(cleanup) = std::fs::remove_file(partial) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?partial, error = %cleanup, "could not remove partial download");
            }
        }
        fetch_err(e)
    })
}
