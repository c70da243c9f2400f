use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use approx::relative_eq;
use sortline_core::inference::stub::{EchoEngine, EchoPrecision};
use sortline_core::inference::{OutputData, OutputTensor};
use sortline_core::{
    EngineHandle, InferenceEngine, NamedOutputs, NamedTensor, OutputNames, SharedStreamState,
    SortlineError, StreamState, StreamingConfig,
};

fn tiny() -> StreamingConfig {
    StreamingConfig {
        chunk_frames: 4,
        mel_features: 2,
        fifo_capacity: 3,
        spkcache_capacity: 2,
        embedding_dims: 2,
        num_speakers: 2,
    }
}

fn echo_state(precision: EchoPrecision) -> StreamState {
    let engine = EchoEngine::new(2).with_precision(precision);
    StreamState::new(tiny(), EngineHandle::new(engine)).unwrap()
}

/// Echoes like `EchoEngine` but can drop a named output for the first
/// `failures` calls.
struct DroppingEngine {
    inner: EchoEngine,
    drop_output: String,
    failures: usize,
}

impl InferenceEngine for DroppingEngine {
    fn invoke(&mut self, inputs: &[NamedTensor<'_>]) -> Result<NamedOutputs, SortlineError> {
        let full = self.inner.invoke(inputs)?;
        if self.failures == 0 {
            return Ok(full);
        }
        self.failures -= 1;
        let mut partial = NamedOutputs::new();
        for name in full.names().filter(|n| *n != self.drop_output) {
            if let Some(t) = full.get(name) {
                partial.insert(name, t.clone());
            }
        }
        Ok(partial)
    }
}

struct FailingEngine;

impl InferenceEngine for FailingEngine {
    fn invoke(&mut self, _inputs: &[NamedTensor<'_>]) -> Result<NamedOutputs, SortlineError> {
        Err(SortlineError::ModelLoadFailed("session poisoned".into()))
    }
}

struct CountingEngine {
    calls: Arc<AtomicUsize>,
}

impl InferenceEngine for CountingEngine {
    fn invoke(&mut self, _inputs: &[NamedTensor<'_>]) -> Result<NamedOutputs, SortlineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let names = OutputNames::default();
        let mut out = NamedOutputs::new();
        out.insert(
            names.predictions,
            OutputTensor::new(vec![1, 1, 2], OutputData::F32(vec![0.5, 0.5])),
        );
        out.insert(
            names.chunk_lengths,
            OutputTensor::new(vec![1], OutputData::I64(vec![1])),
        );
        out.insert(
            names.chunk_embeddings,
            OutputTensor::new(vec![1, 1, 2], OutputData::F32(vec![0.0, 0.0])),
        );
        Ok(out)
    }
}

#[test]
fn end_to_end_scenario() {
    let mut state = echo_state(EchoPrecision::Full);
    let chunk = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];

    let out = state
        .run_main_model(&chunk, 4, &[], 0, &[0.1, 0.2], 1)
        .unwrap();

    let b = state.buffers();
    assert_eq!(b.chunk.as_slice(), &chunk);
    assert_eq!(b.fifo.as_slice(), &[0.1, 0.2, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(b.spkcache.as_slice(), &[0.0; 4]);
    assert_eq!(b.chunk_length.get(), 4);
    assert_eq!(b.fifo_length.get(), 1);
    assert_eq!(b.spkcache_length.get(), 0);

    assert_eq!(out.chunk_length, 4);
    assert_eq!(out.chunk_embeddings, chunk.to_vec());
    // spkcache 0 + fifo 1 + chunk 4 rows of 2 speakers
    assert_eq!(out.predictions_view(2).unwrap().shape(), &[5, 2]);
}

#[test]
fn over_capacity_chunk_is_truncated_without_error() {
    let mut state = echo_state(EchoPrecision::Full);
    let chunk: Vec<f32> = (1..=9).map(|v| v as f32).collect();

    let out = state.run_main_model(&chunk, 4, &[], 0, &[], 0).unwrap();

    assert_eq!(state.buffers().chunk.as_slice(), &chunk[..8]);
    assert_eq!(out.chunk_embeddings, chunk[..8].to_vec());
    assert_eq!(
        state.diagnostics().truncated_copies.load(Ordering::Relaxed),
        1
    );
}

#[test]
fn shapes_and_storage_never_change_across_calls() {
    let mut state = echo_state(EchoPrecision::Full);
    let chunk_ptr = state.buffers().chunk.as_slice().as_ptr();
    let fifo_ptr = state.buffers().fifo.as_slice().as_ptr();

    for i in 0..32usize {
        let chunk = vec![i as f32; i % 11];
        let fifo = vec![0.5; (i * 3) % 9];
        let spkcache = vec![-0.5; i % 5];
        state
            .run_main_model(&chunk, i % 6, &spkcache, i % 4, &fifo, i % 5)
            .unwrap();

        let b = state.buffers();
        assert_eq!(b.chunk.shape(), &[1, 4, 2]);
        assert_eq!(b.fifo.shape(), &[1, 3, 2]);
        assert_eq!(b.spkcache.shape(), &[1, 2, 2]);
        assert_eq!(b.chunk.as_slice().as_ptr(), chunk_ptr);
        assert_eq!(b.fifo.as_slice().as_ptr(), fifo_ptr);

        assert!(b.chunk_length.get() <= b.chunk_length.limit());
        assert!(b.fifo_length.get() <= b.fifo_length.limit());
        assert!(b.spkcache_length.get() <= b.spkcache_length.limit());
    }
    assert_eq!(state.diagnostics().calls.load(Ordering::Relaxed), 32);
}

#[test]
fn half_precision_embeddings_decode_like_full_precision() {
    let chunk = [0.1, -0.25, 0.333, 1.5, -2.75, 0.0625, 7.0, -0.001];
    let fifo = [0.2, 0.4];

    let wide = echo_state(EchoPrecision::Full)
        .run_main_model(&chunk, 4, &[], 0, &fifo, 1)
        .unwrap();
    let narrow = echo_state(EchoPrecision::Half)
        .run_main_model(&chunk, 4, &[], 0, &fifo, 1)
        .unwrap();

    assert_eq!(wide.chunk_length, narrow.chunk_length);
    assert_eq!(wide.chunk_embeddings.len(), narrow.chunk_embeddings.len());
    assert_eq!(wide.predictions.len(), narrow.predictions.len());
    for (w, n) in wide.chunk_embeddings.iter().zip(&narrow.chunk_embeddings) {
        assert!(
            relative_eq!(*w, *n, epsilon = 1e-4, max_relative = 1e-3),
            "{w} vs {n}"
        );
    }
}

#[test]
fn missing_predictions_fail_and_container_recovers() {
    let engine = DroppingEngine {
        inner: EchoEngine::new(2),
        drop_output: OutputNames::default().predictions,
        failures: 1,
    };
    let mut state = StreamState::new(tiny(), EngineHandle::new(engine)).unwrap();

    let err = state
        .run_main_model(&[1.0; 8], 4, &[], 0, &[], 0)
        .unwrap_err();
    assert!(
        matches!(err, SortlineError::InferenceFailed(ref m) if m.contains("missing required output"))
    );
    assert_eq!(state.diagnostics().failures.load(Ordering::Relaxed), 1);

    let out = state.run_main_model(&[2.0; 8], 4, &[], 0, &[], 0).unwrap();
    assert_eq!(out.chunk_embeddings, vec![2.0; 8]);
}

#[test]
fn missing_length_fails() {
    let engine = DroppingEngine {
        inner: EchoEngine::new(2),
        drop_output: OutputNames::default().chunk_lengths,
        failures: 1,
    };
    let mut state = StreamState::new(tiny(), EngineHandle::new(engine)).unwrap();
    let err = state.run_main_model(&[], 0, &[], 0, &[], 0).unwrap_err();
    assert!(matches!(err, SortlineError::InferenceFailed(_)));
}

#[test]
fn missing_embeddings_fail() {
    let engine = DroppingEngine {
        inner: EchoEngine::new(2),
        drop_output: OutputNames::default().chunk_embeddings,
        failures: 1,
    };
    let mut state = StreamState::new(tiny(), EngineHandle::new(engine)).unwrap();
    let err = state.run_main_model(&[], 0, &[], 0, &[], 0).unwrap_err();
    assert_eq!(err.to_string(), "inference failed: missing chunk embeddings");
}

#[test]
fn engine_errors_surface_as_inference_failures() {
    let mut state = StreamState::new(tiny(), EngineHandle::new(FailingEngine)).unwrap();
    let err = state.run_main_model(&[], 0, &[], 0, &[], 0).unwrap_err();
    assert!(matches!(err, SortlineError::InferenceFailed(ref m) if m.contains("session poisoned")));
}

#[test]
fn engine_handle_is_shared_between_containers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = EngineHandle::new(CountingEngine {
        calls: Arc::clone(&calls),
    });
    let mut a = StreamState::new(tiny(), engine.clone()).unwrap();
    let mut b = StreamState::new(tiny(), engine).unwrap();

    a.run_main_model(&[1.0; 8], 4, &[], 0, &[], 0).unwrap();
    b.run_main_model(&[9.0; 2], 1, &[], 0, &[], 0).unwrap();
    a.run_main_model(&[1.0; 8], 4, &[], 0, &[], 0).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // buffers stay per container
    assert_eq!(a.buffers().chunk.as_slice(), &[1.0; 8]);
    assert_eq!(b.buffers().chunk.as_slice(), &[9.0, 9.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn shared_state_serialises_concurrent_callers() {
    let shared = SharedStreamState::new(echo_state(EchoPrecision::Full));

    let handles: Vec<_> = (0..4)
        .map(|id| {
            let shared = shared.clone();
            thread::spawn(move || {
                let chunk = vec![id as f32; 8];
                for _ in 0..25 {
                    let out = shared.run_main_model(&chunk, 4, &[], 0, &[], 0).unwrap();
                    assert_eq!(out.chunk_embeddings, chunk, "interleaved staging");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("caller thread panicked");
    }

    assert_eq!(shared.diagnostics().calls.load(Ordering::Relaxed), 100);
    assert_eq!(shared.config(), tiny());
}
