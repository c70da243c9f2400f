//! Streaming configuration.
//!
//! Five capacities fully determine every staged buffer shape:
//!
//! | Buffer            | Shape                                   | DType |
//! |-------------------|-----------------------------------------|-------|
//! | `chunk`           | `[1, chunk_frames, mel_features]`       | f32   |
//! | `fifo`            | `[1, fifo_capacity, embedding_dims]`    | f32   |
//! | `spkcache`        | `[1, spkcache_capacity, embedding_dims]`| f32   |
//! | `*_lengths`       | `[1]`                                   | i32   |
//!
//! `num_speakers` only sizes the prediction rows coming back from the engine.
//!
//! `ComputeUnits` is the hardware preference handed to the model loader.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SortlineError};

/// Immutable buffer capacities for one streaming container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Time-axis capacity of the chunk feature buffer.
    pub chunk_frames: usize,
    /// Feature width of the chunk buffer (mel bands).
    pub mel_features: usize,
    /// Row capacity of the FIFO context buffer.
    pub fifo_capacity: usize,
    /// Row capacity of the speaker cache.
    pub spkcache_capacity: usize,
    /// Shared embedding width of the FIFO and speaker cache.
    pub embedding_dims: usize,
    /// Columns of the prediction output.
    #[serde(default = "default_num_speakers")]
    pub num_speakers: usize,
}

fn default_num_speakers() -> usize {
    4
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::sortformer_v2()
    }
}

impl StreamingConfig {
    /// Sortformer v2 streaming export: 124 encoder frames × 8 subsampling.
    pub const fn sortformer_v2() -> Self {
        Self {
            chunk_frames: 124 * 8,
            mel_features: 128,
            fifo_capacity: 124,
            spkcache_capacity: 188,
            embedding_dims: 512,
            num_speakers: 4,
        }
    }

    /// Low-latency export: 6 frames + 1 left + 7 right context, × 8 subsampling.
    pub const fn low_latency() -> Self {
        Self {
            chunk_frames: (6 + 1 + 7) * 8,
            mel_features: 128,
            fifo_capacity: 188,
            spkcache_capacity: 188,
            embedding_dims: 512,
            num_speakers: 4,
        }
    }

    pub fn chunk_shape(&self) -> [usize; 3] {
        [1, self.chunk_frames, self.mel_features]
    }

    pub fn fifo_shape(&self) -> [usize; 3] {
        [1, self.fifo_capacity, self.embedding_dims]
    }

    pub fn spkcache_shape(&self) -> [usize; 3] {
        [1, self.spkcache_capacity, self.embedding_dims]
    }

    /// Load a config from a bundle's `config.json`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SortlineError::ModelLoadFailed(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SortlineError::ModelLoadFailed(format!("invalid config {}: {e}", path.display()))
        })
    }
}

/// Which hardware an inference session may schedule onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeUnits {
    CpuOnly,
    /// GPU execution provider required; session creation fails without it.
    CpuAndGpu,
    /// GPU when it registers, CPU otherwise.
    #[default]
    All,
}

/// How a session treats the accelerator execution provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPolicy {
    Off,
    Required,
    Preferred,
}

impl ComputeUnits {
    /// Parse an `SORTLINE_ORT_EP` value (`cpu` / `directml` / `auto`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(ComputeUnits::CpuOnly),
            "dml" | "directml" | "gpu" => Some(ComputeUnits::CpuAndGpu),
            "auto" => Some(ComputeUnits::All),
            _ => None,
        }
    }

    /// Value of `SORTLINE_ORT_EP`, if set and recognised. Only used as a
    /// default; an explicitly passed `ComputeUnits` always wins.
    pub fn from_env() -> Option<Self> {
        std::env::var("SORTLINE_ORT_EP")
            .ok()
            .and_then(|v| Self::parse(&v))
    }

    pub fn gpu_policy(self) -> GpuPolicy {
        match self {
            ComputeUnits::CpuOnly => GpuPolicy::Off,
            ComputeUnits::CpuAndGpu => GpuPolicy::Required,
            ComputeUnits::All => GpuPolicy::Preferred,
        }
    }
}
