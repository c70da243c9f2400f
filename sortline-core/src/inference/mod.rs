//! Inference engine abstraction.
//!
//! The `InferenceEngine` trait decouples the streaming state from any specific
//! runtime (stub echo, ONNX Runtime, ...). One method: named tensors in, named
//! tensors out, synchronously.
//!
//! `&mut self` on `invoke` reflects that runtimes such as `ort` need exclusive
//! access to a session while it runs. Engines shared between several streaming
//! containers are therefore serialised through `EngineHandle`'s
//! `parking_lot::Mutex`.

pub mod adapter;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::OnnxEngine;

use std::collections::HashMap;
use std::sync::Arc;

use half::f16;
use parking_lot::Mutex;

use crate::buffering::{AlignedBuffer, DType};
use crate::error::Result;

/// Borrowed input data, tagged by element type.
#[derive(Debug, Clone, Copy)]
pub enum TensorData<'a> {
    F32(&'a [f32]),
    I32(&'a [i32]),
}

impl TensorData<'_> {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(d) => d.len(),
            TensorData::I32(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A zero-copy named view over one staged buffer.
#[derive(Debug, Clone, Copy)]
pub struct NamedTensor<'a> {
    pub name: &'static str,
    pub shape: &'a [usize],
    pub data: TensorData<'a>,
}

impl<'a> NamedTensor<'a> {
    pub fn f32(name: &'static str, buf: &'a AlignedBuffer<f32>) -> Self {
        Self {
            name,
            shape: buf.shape(),
            data: TensorData::F32(buf.as_slice()),
        }
    }

    pub fn i32(name: &'static str, buf: &'a AlignedBuffer<i32>) -> Self {
        Self {
            name,
            shape: buf.shape(),
            data: TensorData::I32(buf.as_slice()),
        }
    }
}

/// Owned output data in whatever width the engine produced.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: OutputData,
}

impl OutputTensor {
    pub fn new(shape: Vec<usize>, data: OutputData) -> Self {
        Self { shape, data }
    }
}

/// Named outputs of one engine invocation.
#[derive(Debug, Clone, Default)]
pub struct NamedOutputs {
    tensors: HashMap<String, OutputTensor>,
}

impl NamedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: OutputTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&OutputTensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn f32(&self, name: &str) -> Option<&[f32]> {
        match &self.get(name)?.data {
            OutputData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn f16(&self, name: &str) -> Option<&[f16]> {
        match &self.get(name)?.data {
            OutputData::F16(v) => Some(v),
            _ => None,
        }
    }

    pub fn i32(&self, name: &str) -> Option<&[i32]> {
        match &self.get(name)?.data {
            OutputData::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn i64(&self, name: &str) -> Option<&[i64]> {
        match &self.get(name)?.data {
            OutputData::I64(v) => Some(v),
            _ => None,
        }
    }
}

/// Contract for inference backends.
pub trait InferenceEngine: Send + 'static {
    /// Run the model once on `inputs`.
    ///
    /// # Errors
    /// Any runtime failure, reported as `InferenceFailed`.
    fn invoke(&mut self, inputs: &[NamedTensor<'_>]) -> Result<NamedOutputs>;
}

/// Thread-safe reference-counted handle to any `InferenceEngine` implementor.
#[derive(Clone)]
pub struct EngineHandle(pub Arc<Mutex<dyn InferenceEngine>>);

impl EngineHandle {
    pub fn new<E: InferenceEngine>(engine: E) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }

    pub fn invoke(&self, inputs: &[NamedTensor<'_>]) -> Result<NamedOutputs> {
        self.0.lock().invoke(inputs)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}
