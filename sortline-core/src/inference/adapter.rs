//! Inference adapter: binds staged buffers to the engine's input names, runs
//! the engine once, and decodes its outputs into f32 arrays.
//!
//! ## Engine I/O
//!
//! | Name                        | Shape                         | DType       | Direction |
//! |-----------------------------|-------------------------------|-------------|-----------|
//! | `chunk`                     | `[1, chunk_frames, mel]`      | f32         | in        |
//! | `chunk_lengths`             | `[1]`                         | i32         | in        |
//! | `spkcache`                  | `[1, spkcache_cap, emb]`      | f32         | in        |
//! | `spkcache_lengths`          | `[1]`                         | i32         | in        |
//! | `fifo`                      | `[1, fifo_cap, emb]`          | f32         | in        |
//! | `fifo_lengths`              | `[1]`                         | i32         | in        |
//! | `spkcache_fifo_chunk_preds` | `[1, frames, speakers]`       | f32 / f16   | out       |
//! | `chunk_pre_encode_lengths`  | `[1]`                         | i32 / i64   | out       |
//! | `chunk_pre_encode_embs`     | `[1, frames, emb]`            | f32 / f16   | out       |
//!
//! Reduced-precision exports emit the float outputs as f16. Decoding tries
//! the wide width first and upcasts the narrow one, so callers always see f32.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EngineHandle, NamedOutputs, NamedTensor};
use crate::error::{Result, SortlineError};

pub const CHUNK: &str = "chunk";
pub const CHUNK_LENGTHS: &str = "chunk_lengths";
pub const SPKCACHE: &str = "spkcache";
pub const SPKCACHE_LENGTHS: &str = "spkcache_lengths";
pub const FIFO: &str = "fifo";
pub const FIFO_LENGTHS: &str = "fifo_lengths";

/// Output tensor names of the main model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputNames {
    pub predictions: String,
    pub chunk_lengths: String,
    pub chunk_embeddings: String,
}

impl Default for OutputNames {
    fn default() -> Self {
        Self {
            predictions: "spkcache_fifo_chunk_preds".into(),
            chunk_lengths: "chunk_pre_encode_lengths".into(),
            chunk_embeddings: "chunk_pre_encode_embs".into(),
        }
    }
}

/// Decoded result of one main-model call. Owned by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct MainModelOutput {
    /// Row-major `[spkcache_len + fifo_len + chunk_len, num_speakers]`.
    pub predictions: Vec<f32>,
    /// Row-major `[frames, embedding_dims]`.
    pub chunk_embeddings: Vec<f32>,
    /// Valid embedding rows as reported by the engine.
    pub chunk_length: usize,
}

impl MainModelOutput {
    /// Predictions as `[rows, num_speakers]`, if the length divides evenly.
    pub fn predictions_view(&self, num_speakers: usize) -> Option<ArrayView2<'_, f32>> {
        rows_view(&self.predictions, num_speakers)
    }

    /// Embeddings as `[rows, embedding_dims]`, if the length divides evenly.
    pub fn embeddings_view(&self, embedding_dims: usize) -> Option<ArrayView2<'_, f32>> {
        rows_view(&self.chunk_embeddings, embedding_dims)
    }

    /// The `chunk_length` valid embedding rows, flattened.
    pub fn valid_embeddings(&self, embedding_dims: usize) -> &[f32] {
        let end = (self.chunk_length * embedding_dims).min(self.chunk_embeddings.len());
        &self.chunk_embeddings[..end]
    }
}

fn rows_view(data: &[f32], width: usize) -> Option<ArrayView2<'_, f32>> {
    if width == 0 || data.len() % width != 0 {
        return None;
    }
    ArrayView2::from_shape((data.len() / width, width), data).ok()
}

/// One entry of an ordered decode chain.
struct DecodeAttempt<T> {
    width: &'static str,
    decode: fn(&NamedOutputs, &str) -> Option<T>,
}

/// Run `attempts` in order; the first to produce a value wins.
fn first_decoded<T>(
    outputs: &NamedOutputs,
    name: &str,
    attempts: &[DecodeAttempt<T>],
) -> Option<(&'static str, T)> {
    attempts
        .iter()
        .find_map(|a| (a.decode)(outputs, name).map(|v| (a.width, v)))
}

fn decode_f32(outputs: &NamedOutputs, name: &str) -> Option<Vec<f32>> {
    outputs.f32(name).map(<[f32]>::to_vec)
}

fn decode_f16_upcast(outputs: &NamedOutputs, name: &str) -> Option<Vec<f32>> {
    outputs
        .f16(name)
        .map(|v| v.iter().map(|x| x.to_f32()).collect())
}

fn decode_i32_scalar(outputs: &NamedOutputs, name: &str) -> Option<i64> {
    outputs.i32(name)?.first().map(|&v| i64::from(v))
}

fn decode_i64_scalar(outputs: &NamedOutputs, name: &str) -> Option<i64> {
    outputs.i64(name)?.first().copied()
}

const FLOAT_DECODERS: &[DecodeAttempt<Vec<f32>>] = &[
    DecodeAttempt {
        width: "f32",
        decode: decode_f32,
    },
    DecodeAttempt {
        width: "f16",
        decode: decode_f16_upcast,
    },
];

const LENGTH_DECODERS: &[DecodeAttempt<i64>] = &[
    DecodeAttempt {
        width: "i32",
        decode: decode_i32_scalar,
    },
    DecodeAttempt {
        width: "i64",
        decode: decode_i64_scalar,
    },
];

fn missing(name: &str) -> SortlineError {
    SortlineError::InferenceFailed(format!("missing required output: {name}"))
}

/// Decode the engine's named outputs.
///
/// # Errors
/// `InferenceFailed` when predictions or the length scalar are absent, when no
/// embedding width decodes, or when the reported length is negative.
pub fn decode(outputs: &NamedOutputs, names: &OutputNames) -> Result<MainModelOutput> {
    let (pred_width, predictions) = first_decoded(outputs, &names.predictions, FLOAT_DECODERS)
        .ok_or_else(|| missing(&names.predictions))?;

    let (_, raw_length) = first_decoded(outputs, &names.chunk_lengths, LENGTH_DECODERS)
        .ok_or_else(|| missing(&names.chunk_lengths))?;
    let chunk_length = usize::try_from(raw_length).map_err(|_| {
        SortlineError::InferenceFailed(format!(
            "negative chunk embedding length reported: {raw_length}"
        ))
    })?;

    let (emb_width, chunk_embeddings) =
        first_decoded(outputs, &names.chunk_embeddings, FLOAT_DECODERS)
            .ok_or_else(|| SortlineError::InferenceFailed("missing chunk embeddings".into()))?;

    if pred_width != "f32" || emb_width != "f32" {
        debug!(pred_width, emb_width, "upcast reduced-precision outputs");
    }

    Ok(MainModelOutput {
        predictions,
        chunk_embeddings,
        chunk_length,
    })
}

/// Invoke the engine once with the six staged inputs and decode the result.
///
/// No retry: any engine error surfaces as `InferenceFailed`.
pub fn invoke(
    engine: &EngineHandle,
    inputs: &[NamedTensor<'_>],
    names: &OutputNames,
) -> Result<MainModelOutput> {
    let outputs = engine.invoke(inputs).map_err(|e| match e {
        SortlineError::InferenceFailed(_) => e,
        other => SortlineError::InferenceFailed(other.to_string()),
    })?;
    decode(&outputs, names)
}
