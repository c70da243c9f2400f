//! # sortline-core
//!
//! Streaming speaker-diarization state manager.
//!
//! ## Architecture
//!
//! ```text
//! caller (chunk features + spkcache + fifo, in stream order)
//!     │
//!     ▼
//! StreamState::run_main_model ── copy_padded ──► aligned buffers + length scalars
//!     │
//!     ▼
//! adapter::invoke ── named tensors ──► InferenceEngine (ONNX / echo stub)
//!     │
//!     ▼
//! MainModelOutput { predictions, chunk_embeddings, chunk_length }
//! ```
//!
//! Buffers are allocated once per stream and overwritten in place; the per-chunk
//! path does not allocate for staging.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod inference;
pub mod model;

// Convenience re-exports for downstream crates
pub use buffering::{copy_padded, AlignedBuffer, BufferPool, CopyReport, LengthScalar};
pub use config::{ComputeUnits, GpuPolicy, StreamingConfig};
pub use engine::{SharedStreamState, StreamDiagnostics, StreamState};
pub use error::SortlineError;
pub use inference::adapter::{MainModelOutput, OutputNames};
pub use inference::{EngineHandle, InferenceEngine, NamedOutputs, NamedTensor};
pub use model::{LoadedModel, ModelConfig};

#[cfg(feature = "onnx")]
pub use inference::OnnxEngine;

#[cfg(feature = "onnx")]
pub use model::{load, load_remote};
