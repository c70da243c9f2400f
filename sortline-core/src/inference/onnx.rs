//! Main-model ONNX backend via the `ort` crate.
//!
//! Targets a streaming Sortformer export with six named inputs
//! (`chunk`, `chunk_lengths`, `spkcache`, `spkcache_lengths`, `fifo`,
//! `fifo_lengths`). Float inputs are bound as zero-copy `TensorRef` views over
//! the stream's aligned buffers. Length inputs are staged as i32; exports that
//! declare them int64 get them widened into a fixed array owned by the engine.
//! Outputs are copied out once into `NamedOutputs` in whatever width the
//! session produced (f32, f16, i64 or i32).

use std::path::Path;

use half::f16;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, TensorRef};
use ort::{ep, Error as OrtError};
use tracing::{info, warn};

use super::adapter::{CHUNK, CHUNK_LENGTHS, FIFO, FIFO_LENGTHS, SPKCACHE, SPKCACHE_LENGTHS};
use super::{InferenceEngine, NamedOutputs, NamedTensor, OutputData, OutputTensor, TensorData};
use crate::config::{ComputeUnits, GpuPolicy};
use crate::error::{Result, SortlineError};

const REQUIRED_INPUTS: [&str; 6] = [
    CHUNK,
    CHUNK_LENGTHS,
    SPKCACHE,
    SPKCACHE_LENGTHS,
    FIFO,
    FIFO_LENGTHS,
];

/// Length inputs, in the slot order of `OnnxEngine::wide_lengths`.
const LENGTH_INPUTS: [&str; 3] = [CHUNK_LENGTHS, SPKCACHE_LENGTHS, FIFO_LENGTHS];

fn session_err(e: OrtError) -> SortlineError {
    SortlineError::ModelLoadFailed(e.to_string())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn create_session(model_path: &Path, units: ComputeUnits) -> Result<Session> {
    let policy = units.gpu_policy();
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = env_usize("SORTLINE_ORT_INTRA_THREADS")
        .unwrap_or_else(|| logical_cores.clamp(2, 8))
        .clamp(1, 32);
    let inter_threads = env_usize("SORTLINE_ORT_INTER_THREADS")
        .unwrap_or(1)
        .clamp(1, 8);

    let mut builder = SessionBuilder::new()
        .map_err(session_err)?
        .with_intra_threads(intra_threads)
        .map_err(session_err)?
        .with_inter_threads(inter_threads)
        .map_err(session_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(session_err)?;
    info!(
        intra_threads,
        inter_threads, logical_cores, ?units, "ONNX session threading configured"
    );

    #[cfg(target_os = "windows")]
    {
        builder = match policy {
            GpuPolicy::Off => builder
                .with_execution_providers([ep::CPU::default().build()])
                .map_err(session_err)?,
            GpuPolicy::Required => {
                info!("ONNX EP: directml (strict)");
                builder
                    .with_execution_providers([
                        ep::DirectML::default()
                            .with_device_id(0)
                            .build()
                            .error_on_failure(),
                        ep::CPU::default().build(),
                    ])
                    .map_err(session_err)?
            }
            GpuPolicy::Preferred => {
                info!("ONNX EP: auto (directml -> cpu)");
                builder
                    .with_execution_providers([
                        ep::DirectML::default()
                            .with_device_id(0)
                            .build()
                            .fail_silently(),
                        ep::CPU::default().build(),
                    ])
                    .map_err(session_err)?
            }
        };
    }

    #[cfg(not(target_os = "windows"))]
    {
        match policy {
            GpuPolicy::Required => {
                return Err(SortlineError::ModelLoadFailed(
                    "compute_units=cpu_and_gpu needs the DirectML EP, which is Windows-only"
                        .into(),
                ))
            }
            GpuPolicy::Preferred => info!("no accelerator EP on this host; using CPU EP"),
            GpuPolicy::Off => {}
        }
        builder = builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(session_err)?;
    }

    builder.commit_from_file(model_path).map_err(session_err)
}

/// Element type an export declares for a length input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LengthWidth {
    I32,
    I64,
}

fn length_width(name: &str, declared: Option<TensorElementType>) -> Result<LengthWidth> {
    match declared {
        Some(TensorElementType::Int32) => Ok(LengthWidth::I32),
        Some(TensorElementType::Int64) => Ok(LengthWidth::I64),
        other => Err(SortlineError::ModelLoadFailed(format!(
            "input `{name}` must be int32 or int64, model declares {other:?}"
        ))),
    }
}

fn length_slot(name: &str) -> Option<usize> {
    LENGTH_INPUTS.iter().position(|n| *n == name)
}

/// Copy the staged i32 length scalars into `wide`, in `LENGTH_INPUTS` order.
fn widen_lengths(inputs: &[NamedTensor<'_>], wide: &mut [i64; 3]) -> Result<()> {
    for (slot, name) in LENGTH_INPUTS.iter().enumerate() {
        let tensor = inputs
            .iter()
            .find(|t| t.name == *name)
            .ok_or_else(|| SortlineError::InferenceFailed(format!("missing input: {name}")))?;
        wide[slot] = match tensor.data {
            TensorData::I32(v) if !v.is_empty() => i64::from(v[0]),
            _ => {
                return Err(SortlineError::InferenceFailed(format!(
                    "input {name} is not an i32 scalar"
                )))
            }
        };
    }
    Ok(())
}

/// The streaming main model loaded into an `ort::Session`.
pub struct OnnxEngine {
    session: Session,
    output_names: Vec<String>,
    length_widths: [LengthWidth; 3],
    wide_lengths: [i64; 3],
}

impl OnnxEngine {
    /// Build a session for `path` and check it exposes the six streaming inputs.
    ///
    /// # Errors
    /// `ModelLoadFailed` if the file is missing, the session cannot be built, a
    /// required input is absent, or a length input is neither int32 nor int64.
    pub fn new(path: impl AsRef<Path>, units: ComputeUnits) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SortlineError::ModelLoadFailed(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let size_mb = std::fs::metadata(path)
            .map(|m| m.len() as f64 / 1_048_576.0)
            .unwrap_or(0.0);

        info!("=== OnnxEngine Startup Report ===");
        info!("  path: {:?}", path);
        info!("  size: {:.2} MB", size_mb);

        let session = create_session(path, units)?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        info!("  inputs: {:?}", input_names);
        info!("  outputs: {:?}", output_names);

        if let Some(absent) = REQUIRED_INPUTS
            .iter()
            .find(|req| !input_names.iter().any(|n| n == *req))
        {
            return Err(SortlineError::ModelLoadFailed(format!(
                "model has no `{absent}` input"
            )));
        }

        let mut length_widths = [LengthWidth::I32; 3];
        for (slot, name) in LENGTH_INPUTS.iter().enumerate() {
            let declared = session
                .inputs()
                .iter()
                .find(|outlet| outlet.name() == *name)
                .and_then(|outlet| outlet.dtype().tensor_type());
            length_widths[slot] = length_width(name, declared)?;
        }
        info!("  length inputs: {:?}", length_widths);

        info!("=== OnnxEngine ready ===");
        Ok(Self {
            session,
            output_names,
            length_widths,
            wide_lengths: [0; 3],
        })
    }
}

fn input_shape(tensor: &NamedTensor<'_>) -> Vec<i64> {
    tensor.shape.iter().map(|&d| d as i64).collect()
}

fn to_input<'a>(tensor: &NamedTensor<'a>) -> std::result::Result<SessionInputValue<'a>, OrtError> {
    let shape = input_shape(tensor);
    Ok(match tensor.data {
        TensorData::F32(data) => SessionInputValue::from(TensorRef::from_array_view((shape, data))?),
        TensorData::I32(data) => SessionInputValue::from(TensorRef::from_array_view((shape, data))?),
    })
}

fn to_wide_input<'a>(
    tensor: &NamedTensor<'a>,
    wide: &'a [i64],
) -> std::result::Result<SessionInputValue<'a>, OrtError> {
    Ok(SessionInputValue::from(TensorRef::from_array_view((
        input_shape(tensor),
        wide,
    ))?))
}

/// Host width an output is copied out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputWidth {
    F32,
    F16,
    I64,
    I32,
}

fn output_width(declared: TensorElementType) -> Option<OutputWidth> {
    match declared {
        TensorElementType::Float32 => Some(OutputWidth::F32),
        TensorElementType::Float16 => Some(OutputWidth::F16),
        TensorElementType::Int64 => Some(OutputWidth::I64),
        TensorElementType::Int32 => Some(OutputWidth::I32),
        _ => None,
    }
}

fn dims(shape: &[i64]) -> Vec<usize> {
    shape.iter().map(|&d| d.max(0) as usize).collect()
}

/// Copy one output out of the session in the width it declares.
fn extract(value: &DynValue) -> Option<OutputTensor> {
    let width = output_width(value.dtype().tensor_type()?)?;
    let (shape, data) = match width {
        OutputWidth::F32 => {
            let (shape, data) = value.try_extract_tensor::<f32>().ok()?;
            (shape, OutputData::F32(data.to_vec()))
        }
        OutputWidth::F16 => {
            let (shape, data) = value.try_extract_tensor::<f16>().ok()?;
            (shape, OutputData::F16(data.to_vec()))
        }
        OutputWidth::I64 => {
            let (shape, data) = value.try_extract_tensor::<i64>().ok()?;
            (shape, OutputData::I64(data.to_vec()))
        }
        OutputWidth::I32 => {
            let (shape, data) = value.try_extract_tensor::<i32>().ok()?;
            (shape, OutputData::I32(data.to_vec()))
        }
    };
    Some(OutputTensor::new(dims(shape), data))
}

impl InferenceEngine for OnnxEngine {
    fn invoke(&mut self, inputs: &[NamedTensor<'_>]) -> Result<NamedOutputs> {
        if self.length_widths.contains(&LengthWidth::I64) {
            widen_lengths(inputs, &mut self.wide_lengths)?;
        }
        let widths = &self.length_widths;
        let wide = &self.wide_lengths;

        let bound: Vec<(String, SessionInputValue<'_>)> = inputs
            .iter()
            .map(|t| {
                let value = match length_slot(t.name) {
                    Some(slot) if widths[slot] == LengthWidth::I64 => {
                        to_wide_input(t, &wide[slot..=slot])
                    }
                    _ => to_input(t),
                };
                value.map(|v| (t.name.to_string(), v))
            })
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SortlineError::InferenceFailed(e.to_string()))?;

        let outputs = self
            .session
            .run(bound)
            .map_err(|e| SortlineError::InferenceFailed(e.to_string()))?;

        let mut named = NamedOutputs::new();
        for name in &self.output_names {
            let Some(value) = outputs.get(name.as_str()) else {
                continue;
            };
            match extract(value) {
                Some(tensor) => named.insert(name.clone(), tensor),
                None => warn!(output = %name, "skipping output with unsupported element type"),
            }
        }
        Ok(named)
    }
}

#[cfg(test)]
mod tests {
    use ort::value::Tensor;

    use super::*;

    fn scalar<'a>(name: &'static str, value: &'a [i32]) -> NamedTensor<'a> {
        NamedTensor {
            name,
            shape: &[1],
            data: TensorData::I32(value),
        }
    }

    #[test]
    fn missing_model_is_a_load_failure() {
        let err = OnnxEngine::new("/nonexistent/sortformer.onnx", ComputeUnits::CpuOnly)
            .err()
            .unwrap();
        assert!(matches!(err, SortlineError::ModelLoadFailed(_)));
    }

    #[test]
    fn length_inputs_accept_int32_and_int64_only() {
        assert_eq!(
            length_width(CHUNK_LENGTHS, Some(TensorElementType::Int64)).unwrap(),
            LengthWidth::I64
        );
        assert_eq!(
            length_width(FIFO_LENGTHS, Some(TensorElementType::Int32)).unwrap(),
            LengthWidth::I32
        );
        let err = length_width(SPKCACHE_LENGTHS, Some(TensorElementType::Float32)).unwrap_err();
        assert!(matches!(err, SortlineError::ModelLoadFailed(ref m) if m.contains("spkcache_lengths")));
        assert!(length_width(CHUNK_LENGTHS, None).is_err());
    }

    #[test]
    fn lengths_widen_in_slot_order() {
        let chunk = [112];
        let cache = [0];
        let fifo = [37];
        // engine input order differs from slot order
        let inputs = [
            scalar(FIFO_LENGTHS, &fifo),
            scalar(CHUNK_LENGTHS, &chunk),
            scalar(SPKCACHE_LENGTHS, &cache),
        ];
        let mut wide = [-1i64; 3];
        widen_lengths(&inputs, &mut wide).unwrap();
        assert_eq!(wide, [112, 0, 37]);
        assert_eq!(length_slot(FIFO_LENGTHS), Some(2));
        assert_eq!(length_slot(CHUNK), None);
    }

    #[test]
    fn widening_reports_missing_length() {
        let chunk = [4];
        let inputs = [scalar(CHUNK_LENGTHS, &chunk)];
        let err = widen_lengths(&inputs, &mut [0; 3]).unwrap_err();
        assert!(matches!(err, SortlineError::InferenceFailed(ref m) if m.contains("spkcache_lengths")));
    }

    #[test]
    fn output_widths_cover_float_and_integer_heads() {
        assert_eq!(output_width(TensorElementType::Float32), Some(OutputWidth::F32));
        assert_eq!(output_width(TensorElementType::Float16), Some(OutputWidth::F16));
        assert_eq!(output_width(TensorElementType::Int64), Some(OutputWidth::I64));
        assert_eq!(output_width(TensorElementType::Int32), Some(OutputWidth::I32));
        assert_eq!(output_width(TensorElementType::Uint8), None);
        assert_eq!(dims(&[1, -1, 4]), vec![1, 0, 4]);
    }

    #[test]
    fn half_precision_output_is_extracted_as_f16() {
        let values = vec![f16::from_f32(0.5), f16::from_f32(-2.0)];
        let tensor = Tensor::from_array(([1usize, 2], values.clone().into_boxed_slice())).unwrap();
        let out = extract(&tensor.into_dyn()).unwrap();
        assert_eq!(out.shape, vec![1, 2]);
        assert_eq!(out.data, OutputData::F16(values));
    }

    #[test]
    fn int64_length_output_is_extracted_as_i64() {
        let tensor = Tensor::from_array(([1usize], vec![14i64].into_boxed_slice())).unwrap();
        let out = extract(&tensor.into_dyn()).unwrap();
        assert_eq!(out.data, OutputData::I64(vec![14]));
    }
}
