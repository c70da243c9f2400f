//! Per-chunk latency benchmark for `StreamState::run_main_model`.
//!
//! ```text
//! benchmark [--iterations N] [--preset sortformer_v2|low_latency] [--half]
//!           [--model PATH]   (onnx feature)
//!           [--output report.json]
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sortline_core::inference::stub::{EchoEngine, EchoPrecision};
use sortline_core::{EngineHandle, StreamState, StreamingConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Args {
    iterations: usize,
    config: StreamingConfig,
    precision: EchoPrecision,
    model: Option<PathBuf>,
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Summary {
    backend: String,
    config: StreamingConfig,
    iterations: usize,
    p50_latency_ms: f64,
    p95_latency_ms: f64,
    avg_latency_ms: f64,
    max_latency_ms: f64,
    failures: usize,
    truncated_copies: usize,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        iterations: 200,
        config: StreamingConfig::default(),
        precision: EchoPrecision::Full,
        model: None,
        output: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--iterations" => {
                let v = it.next().context("--iterations needs a value")?;
                args.iterations = v.parse().context("--iterations must be an integer")?;
            }
            "--preset" => match it.next().as_deref() {
                Some("sortformer_v2") => args.config = StreamingConfig::sortformer_v2(),
                Some("low_latency") => args.config = StreamingConfig::low_latency(),
                other => bail!("unknown preset: {other:?}"),
            },
            "--half" => args.precision = EchoPrecision::Half,
            "--model" => args.model = Some(it.next().context("--model needs a path")?.into()),
            "--output" => args.output = Some(it.next().context("--output needs a path")?.into()),
            "-h" | "--help" => {
                println!(
                    "usage: benchmark [--iterations N] [--preset sortformer_v2|low_latency] \
                     [--half] [--model PATH] [--output FILE]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    if args.iterations == 0 {
        bail!("--iterations must be positive");
    }
    Ok(args)
}

#[cfg(feature = "onnx")]
fn engine_for(args: &Args) -> Result<(String, EngineHandle)> {
    use sortline_core::ModelConfig;

    if let Some(path) = &args.model {
        let mut cfg = ModelConfig::new(args.config);
        cfg.model_path = Some(path.clone());
        let loaded = sortline_core::load(&cfg)?;
        info!(load_ms = loaded.load_duration.as_secs_f64() * 1_000.0, "model loaded");
        return Ok((format!("onnx:{}", path.display()), loaded.engine));
    }
    Ok(echo_engine(args))
}

#[cfg(not(feature = "onnx"))]
fn engine_for(args: &Args) -> Result<(String, EngineHandle)> {
    if args.model.is_some() {
        bail!("--model requires the 'onnx' feature");
    }
    Ok(echo_engine(args))
}

fn echo_engine(args: &Args) -> (String, EngineHandle) {
    let engine = EchoEngine::new(args.config.num_speakers).with_precision(args.precision);
    (format!("echo:{:?}", args.precision), EngineHandle::new(engine))
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn run() -> Result<()> {
    let args = parse_args()?;
    let (backend, engine) = engine_for(&args)?;
    let cfg = args.config;
    let mut state = StreamState::new(cfg, engine)?;

    // Deterministic synthetic stream; the buffers only care about sizes.
    let chunk: Vec<f32> = (0..cfg.chunk_frames * cfg.mel_features)
        .map(|i| ((i % 97) as f32 / 97.0) - 0.5)
        .collect();
    let fifo = vec![0.01f32; cfg.fifo_capacity * cfg.embedding_dims];
    let spkcache = vec![-0.01f32; cfg.spkcache_capacity * cfg.embedding_dims];

    let mut latencies = Vec::with_capacity(args.iterations);
    let mut failures = 0usize;
    for i in 0..args.iterations {
        // ramp context up from empty, as a fresh stream would
        let fifo_rows = (i + 1).min(cfg.fifo_capacity);
        let cache_rows = i.saturating_sub(cfg.fifo_capacity).min(cfg.spkcache_capacity);
        let started = Instant::now();
        let result = state.run_main_model(
            &chunk,
            cfg.chunk_frames,
            &spkcache[..cache_rows * cfg.embedding_dims],
            cache_rows,
            &fifo[..fifo_rows * cfg.embedding_dims],
            fifo_rows,
        );
        latencies.push(started.elapsed().as_secs_f64() * 1_000.0);
        if result.is_err() {
            failures += 1;
        }
    }

    latencies.sort_by(|a, b| a.total_cmp(b));
    let diagnostics = state.diagnostics();
    let summary = Summary {
        backend,
        config: cfg,
        iterations: args.iterations,
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        avg_latency_ms: latencies.iter().sum::<f64>() / latencies.len() as f64,
        max_latency_ms: latencies.last().copied().unwrap_or(0.0),
        failures,
        truncated_copies: diagnostics
            .truncated_copies
            .load(std::sync::atomic::Ordering::Relaxed),
    };

    let json = serde_json::to_string_pretty(&summary)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("writing report to {}", path.display()))?;
            info!(path = ?path, "benchmark report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    if let Err(e) = run() {
        eprintln!("benchmark failed: {e:#}");
        std::process::exit(1);
    }
}
