//! `StreamState`: per-stream buffer owner and the single per-chunk entry point.
//!
//! ## Per-chunk flow
//!
//! ```text
//! run_main_model(chunk, spkcache, fifo, lengths)
//!     ├─► copy_padded × 3        → chunk / spkcache / fifo buffers (in place)
//!     ├─► LengthScalar::set × 3  → clamped to row capacity
//!     └─► adapter::invoke        → engine runs once, outputs decoded to f32
//! ```
//!
//! ## Threading
//!
//! Buffers are overwritten in place, so at most one call may be in flight per
//! container. `run_main_model` takes `&mut self`; callers that must share a
//! container across threads wrap it in [`SharedStreamState`], whose mutex is
//! held for the whole call. Chunks must still be submitted in stream order.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn};

use crate::{
    buffering::{copy_padded, AlignedBuffer, BufferPool, LengthScalar},
    config::StreamingConfig,
    error::Result,
    inference::{
        adapter::{self, MainModelOutput, OutputNames},
        EngineHandle, NamedTensor,
    },
};

/// Counters updated by every `run_main_model` call.
#[derive(Debug, Default)]
pub struct StreamDiagnostics {
    pub calls: AtomicUsize,
    pub failures: AtomicUsize,
    /// Source sequences longer than their buffer (tail dropped).
    pub truncated_copies: AtomicUsize,
    /// Caller lengths larger than their buffer's row capacity.
    pub clamped_lengths: AtomicUsize,
    pub last_latency_us: AtomicU64,
}

impl StreamDiagnostics {
    pub fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.truncated_copies.store(0, Ordering::Relaxed);
        self.clamped_lengths.store(0, Ordering::Relaxed);
        self.last_latency_us.store(0, Ordering::Relaxed);
    }
}

/// The three staged (buffer, length) pairs.
#[derive(Debug)]
pub struct StreamBuffers {
    pub chunk: AlignedBuffer<f32>,
    pub chunk_length: LengthScalar,
    pub fifo: AlignedBuffer<f32>,
    pub fifo_length: LengthScalar,
    pub spkcache: AlignedBuffer<f32>,
    pub spkcache_length: LengthScalar,
}

impl StreamBuffers {
    fn allocate(pool: &mut BufferPool, config: &StreamingConfig) -> Result<Self> {
        let chunk: AlignedBuffer<f32> = pool.allocate(&config.chunk_shape())?;
        let fifo: AlignedBuffer<f32> = pool.allocate(&config.fifo_shape())?;
        let spkcache: AlignedBuffer<f32> = pool.allocate(&config.spkcache_shape())?;
        Ok(Self {
            chunk_length: pool.allocate_length(chunk.rows())?,
            fifo_length: pool.allocate_length(fifo.rows())?,
            spkcache_length: pool.allocate_length(spkcache.rows())?,
            chunk,
            fifo,
            spkcache,
        })
    }

    /// Named zero-copy views in engine input order.
    pub fn named_inputs(&self) -> [NamedTensor<'_>; 6] {
        [
            NamedTensor::f32(adapter::CHUNK, &self.chunk),
            NamedTensor::i32(adapter::CHUNK_LENGTHS, self.chunk_length.buffer()),
            NamedTensor::f32(adapter::SPKCACHE, &self.spkcache),
            NamedTensor::i32(adapter::SPKCACHE_LENGTHS, self.spkcache_length.buffer()),
            NamedTensor::f32(adapter::FIFO, &self.fifo),
            NamedTensor::i32(adapter::FIFO_LENGTHS, self.fifo_length.buffer()),
        ]
    }
}

/// Owns one stream's staged buffers and drives the main model per chunk.
pub struct StreamState {
    config: StreamingConfig,
    engine: EngineHandle,
    output_names: OutputNames,
    buffers: StreamBuffers,
    diagnostics: Arc<StreamDiagnostics>,
}

impl StreamState {
    /// Allocate all buffers for `config` with the default alignment.
    ///
    /// # Errors
    /// `AllocationFailed` if any capacity is zero or the allocator refuses.
    pub fn new(config: StreamingConfig, engine: EngineHandle) -> Result<Self> {
        Self::with_pool(config, engine, &mut BufferPool::new())
    }

    /// Allocate from a caller-provided pool (e.g. a non-default alignment).
    pub fn with_pool(
        config: StreamingConfig,
        engine: EngineHandle,
        pool: &mut BufferPool,
    ) -> Result<Self> {
        let buffers = StreamBuffers::allocate(pool, &config)?;
        info!(
            chunk = ?config.chunk_shape(),
            fifo = ?config.fifo_shape(),
            spkcache = ?config.spkcache_shape(),
            alignment = pool.alignment(),
            bytes = pool.allocated_bytes(),
            "stream buffers allocated"
        );
        Ok(Self {
            config,
            engine,
            output_names: OutputNames::default(),
            buffers,
            diagnostics: Arc::new(StreamDiagnostics::default()),
        })
    }

    /// Override the engine's output tensor names.
    pub fn with_output_names(mut self, names: OutputNames) -> Self {
        self.output_names = names;
        self
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Read-only view of what was staged by the most recent call.
    pub fn buffers(&self) -> &StreamBuffers {
        &self.buffers
    }

    pub fn diagnostics(&self) -> Arc<StreamDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Stage one chunk plus its context and run the main model once.
    ///
    /// `chunk` is row-major `[frames, mel_features]`; `spkcache` and `fifo` are
    /// row-major `[rows, embedding_dims]`. Lengths count rows. Anything beyond
    /// a buffer's capacity is dropped rather than rejected.
    ///
    /// # Errors
    /// `InferenceFailed` if the engine errors or omits a required output. The
    /// container stays usable for the next chunk.
    pub fn run_main_model(
        &mut self,
        chunk: &[f32],
        chunk_length: usize,
        spkcache: &[f32],
        spkcache_length: usize,
        fifo: &[f32],
        fifo_length: usize,
    ) -> Result<MainModelOutput> {
        let span = info_span!("run_main_model", chunk_length, spkcache_length, fifo_length);
        let _enter = span.enter();
        let started = Instant::now();
        self.diagnostics.calls.fetch_add(1, Ordering::Relaxed);

        self.stage(chunk, chunk_length, spkcache, spkcache_length, fifo, fifo_length);

        let inputs = self.buffers.named_inputs();
        let result = adapter::invoke(&self.engine, &inputs, &self.output_names);

        let elapsed = started.elapsed();
        self.diagnostics
            .last_latency_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);

        match &result {
            Ok(out) => debug!(
                elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
                reported_chunk_length = out.chunk_length,
                "main model done"
            ),
            Err(e) => {
                self.diagnostics.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "main model call failed");
            }
        }
        result
    }

    fn stage(
        &mut self,
        chunk: &[f32],
        chunk_length: usize,
        spkcache: &[f32],
        spkcache_length: usize,
        fifo: &[f32],
        fifo_length: usize,
    ) {
        let b = &mut self.buffers;
        let staged = [
            ("chunk", copy_padded(chunk, &mut b.chunk, 0.0)),
            ("spkcache", copy_padded(spkcache, &mut b.spkcache, 0.0)),
            ("fifo", copy_padded(fifo, &mut b.fifo, 0.0)),
        ];
        for (buffer, report) in staged {
            if report.truncated() {
                self.diagnostics
                    .truncated_copies
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    buffer,
                    copied = report.copied,
                    dropped = report.dropped,
                    "source exceeds buffer capacity; tail dropped"
                );
            }
        }

        let lengths = [
            ("chunk", chunk_length, b.chunk_length.set(chunk_length)),
            ("spkcache", spkcache_length, b.spkcache_length.set(spkcache_length)),
            ("fifo", fifo_length, b.fifo_length.set(fifo_length)),
        ];
        for (buffer, requested, clamped) in lengths {
            if clamped {
                self.diagnostics
                    .clamped_lengths
                    .fetch_add(1, Ordering::Relaxed);
                warn!(buffer, requested, "length exceeds row capacity; clamped");
            }
        }
    }
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamState")
            .field("config", &self.config)
            .field("output_names", &self.output_names)
            .finish_non_exhaustive()
    }
}

/// `StreamState` behind a `parking_lot::Mutex`, for sharing across threads.
///
/// The lock is held for the whole `run_main_model` call, so concurrent callers
/// are serialised rather than interleaving buffer writes. Configuration and
/// diagnostics are read without taking the lock.
#[derive(Clone, Debug)]
pub struct SharedStreamState {
    state: Arc<Mutex<StreamState>>,
    config: StreamingConfig,
    diagnostics: Arc<StreamDiagnostics>,
}

impl SharedStreamState {
    pub fn new(state: StreamState) -> Self {
        Self {
            config: state.config,
            diagnostics: state.diagnostics(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn run_main_model(
        &self,
        chunk: &[f32],
        chunk_length: usize,
        spkcache: &[f32],
        spkcache_length: usize,
        fifo: &[f32],
        fifo_length: usize,
    ) -> Result<MainModelOutput> {
        self.state.lock().run_main_model(
            chunk,
            chunk_length,
            spkcache,
            spkcache_length,
            fifo,
            fifo_length,
        )
    }

    pub fn config(&self) -> StreamingConfig {
        self.config
    }

    pub fn diagnostics(&self) -> Arc<StreamDiagnostics> {
        Arc::clone(&self.diagnostics)
    }
}
