//! `EchoEngine`: placeholder backend that mirrors its inputs instead of
//! running a model.
//!
//! Lets the buffer staging and output decoding be exercised end-to-end
//! without an ONNX export:
//! - `chunk_pre_encode_embs` = the staged `chunk` tensor, same shape
//! - `chunk_pre_encode_lengths` = the staged `chunk_lengths` scalar
//! - `spkcache_fifo_chunk_preds` = uniform `1 / num_speakers` rows, one per
//!   valid spkcache + fifo + chunk frame

use half::f16;
use tracing::debug;

use super::adapter::{OutputNames, CHUNK, CHUNK_LENGTHS, FIFO_LENGTHS, SPKCACHE_LENGTHS};
use super::{InferenceEngine, NamedOutputs, NamedTensor, OutputData, OutputTensor, TensorData};
use crate::error::{Result, SortlineError};

/// Width the echo engine emits its float outputs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPrecision {
    #[default]
    Full,
    Half,
}

pub struct EchoEngine {
    num_speakers: usize,
    precision: EchoPrecision,
    names: OutputNames,
    invocations: u64,
}

impl EchoEngine {
    pub fn new(num_speakers: usize) -> Self {
        Self {
            num_speakers,
            precision: EchoPrecision::Full,
            names: OutputNames::default(),
            invocations: 0,
        }
    }

    pub fn with_precision(mut self, precision: EchoPrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    fn floats(&self, values: Vec<f32>) -> OutputData {
        match self.precision {
            EchoPrecision::Full => OutputData::F32(values),
            EchoPrecision::Half => {
                OutputData::F16(values.into_iter().map(f16::from_f32).collect())
            }
        }
    }
}

fn find<'a>(inputs: &'a [NamedTensor<'a>], name: &str) -> Result<&'a NamedTensor<'a>> {
    inputs
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| SortlineError::InferenceFailed(format!("missing input: {name}")))
}

fn scalar(inputs: &[NamedTensor<'_>], name: &str) -> Result<i32> {
    match find(inputs, name)?.data {
        TensorData::I32(v) if !v.is_empty() => Ok(v[0]),
        _ => Err(SortlineError::InferenceFailed(format!(
            "input {name} is not an i32 scalar"
        ))),
    }
}

impl InferenceEngine for EchoEngine {
    fn invoke(&mut self, inputs: &[NamedTensor<'_>]) -> Result<NamedOutputs> {
        self.invocations += 1;

        let chunk = find(inputs, CHUNK)?;
        let TensorData::F32(chunk_data) = chunk.data else {
            return Err(SortlineError::InferenceFailed("chunk is not f32".into()));
        };
        let chunk_len = scalar(inputs, CHUNK_LENGTHS)?;
        let frames = [SPKCACHE_LENGTHS, FIFO_LENGTHS]
            .iter()
            .map(|name| scalar(inputs, name))
            .sum::<Result<i32>>()?
            + chunk_len;
        let frames = frames.max(0) as usize;

        debug!(
            invocation = self.invocations,
            chunk_len, frames, "EchoEngine::invoke"
        );

        let mut out = NamedOutputs::new();
        out.insert(
            self.names.predictions.clone(),
            OutputTensor::new(
                vec![1, frames, self.num_speakers],
                self.floats(vec![
                    1.0 / self.num_speakers.max(1) as f32;
                    frames * self.num_speakers
                ]),
            ),
        );
        out.insert(
            self.names.chunk_lengths.clone(),
            OutputTensor::new(vec![1], OutputData::I32(vec![chunk_len])),
        );
        out.insert(
            self.names.chunk_embeddings.clone(),
            OutputTensor::new(chunk.shape.to_vec(), self.floats(chunk_data.to_vec())),
        );
        Ok(out)
    }
}
