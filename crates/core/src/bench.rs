//! Benchmark executor: times one candidate on one problem shape.
//!
//! Measurement discipline: untimed warmup iterations to reach steady clock
//! and cache state, then timed iterations bracketed by device
//! synchronization so asynchronous kernel launches are fully accounted. The
//! reported latency is the minimum across timed iterations; GPU timing is
//! dominated by best-case occupancy, not average-case noise, so the minimum
//! is the robust statistic here.

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::catalog::Candidate;
use crate::error::TuneError;
use crate::ops::gemm::{GemmInputs, KernelError};
use crate::shape::ProblemShape;

/// Outcome class of one benchmarking attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureStatus {
    /// Candidate ran and produced finite output; latency is valid.
    Ok,
    /// Applicability predicate lied (runtime shape mismatch). Excluded from
    /// comparison entirely.
    Skipped,
    /// Launch/allocation error or non-finite output. Participates in
    /// comparison with an infinite latency sentinel; can never win.
    Failed,
}

/// Result of timing one candidate on one shape. Transient: only the winning
/// measurement's summary survives into a persisted tuning result.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub candidate_id: String,
    pub latency_ns: f64,
    pub status: MeasureStatus,
    pub error: Option<String>,
}

impl Measurement {
    pub fn ok(candidate_id: impl Into<String>, latency_ns: f64) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            latency_ns,
            status: MeasureStatus::Ok,
            error: None,
        }
    }

    pub fn failed(candidate_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            latency_ns: f64::INFINITY,
            status: MeasureStatus::Failed,
            error: Some(detail.into()),
        }
    }

    pub fn skipped(candidate_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            latency_ns: f64::INFINITY,
            status: MeasureStatus::Skipped,
            error: Some(detail.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == MeasureStatus::Ok
    }
}

/// Seam between the search controller and the device.
///
/// Production uses [`BenchmarkExecutor`]; tests substitute a mock with fixed
/// latencies.
pub trait Measurer {
    fn measure(&mut self, shape: &ProblemShape, candidate: &Candidate) -> Measurement;
}

static BLAS_CONTEXT: OnceCell<()> = OnceCell::new();

/// Idempotent process-wide initialization of the device BLAS context.
///
/// The first GEMM on a device pays handle-creation and module-load cost;
/// running a probe matmul here keeps that cost out of every measurement.
/// Called by the executor before its first measurement; safe to call from
/// multiple places.
pub fn ensure_initialized(device: &Device) -> Result<(), TuneError> {
    BLAS_CONTEXT.get_or_try_init(|| -> Result<(), TuneError> {
        let probe = Tensor::zeros((8, 8), DType::F32, device)?;
        let _ = probe.matmul(&probe)?;
        device.synchronize()?;
        debug!("device BLAS context initialized");
        Ok(())
    })?;
    Ok(())
}

struct ShapeBuffers {
    a: Tensor,
    b: Tensor,
    bias: Option<Tensor>,
}

/// Times candidates on a single device context.
///
/// Benchmarking is inherently serialized: concurrent launches on one device
/// context contend for compute units and corrupt timing, so the executor is
/// strictly sequential and `measure` blocks until device synchronization
/// confirms kernel completion.
pub struct BenchmarkExecutor {
    device: Device,
    warmup_iters: usize,
    timed_iters: usize,
}

impl BenchmarkExecutor {
    pub const DEFAULT_WARMUP_ITERS: usize = 10;
    pub const DEFAULT_TIMED_ITERS: usize = 50;

    pub fn new(device: Device) -> Self {
        Self {
            device,
            warmup_iters: Self::DEFAULT_WARMUP_ITERS,
            timed_iters: Self::DEFAULT_TIMED_ITERS,
        }
    }

    pub fn with_iters(mut self, warmup_iters: usize, timed_iters: usize) -> Self {
        self.warmup_iters = warmup_iters;
        self.timed_iters = timed_iters.max(1);
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn alloc_buffers(&self, shape: &ProblemShape) -> Result<ShapeBuffers, TuneError> {
        let storage = shape.indtype.to_candle();
        let a = Tensor::randn(0f32, 1f32, (shape.m, shape.k), &self.device)?.to_dtype(storage)?;
        let b = Tensor::randn(0f32, 1f32, (shape.k, shape.n), &self.device)?.to_dtype(storage)?;
        let bias = if shape.bias {
            let out = shape.outdtype.to_candle();
            Some(Tensor::randn(0f32, 1f32, shape.n, &self.device)?.to_dtype(out)?)
        } else {
            None
        };
        Ok(ShapeBuffers { a, b, bias })
    }

    fn launch_once(
        &self,
        candidate: &Candidate,
        inputs: &GemmInputs<'_>,
    ) -> Result<Tensor, Measurement> {
        match candidate.kernel().launch(inputs) {
            Ok(out) => Ok(out),
            Err(err @ KernelError::ShapeMismatch { .. }) => {
                warn!(
                    candidate = %candidate.id,
                    error = %err,
                    "catalog inconsistency: applicability predicate mismatch"
                );
                Err(Measurement::skipped(&candidate.id, err.to_string()))
            }
            Err(err) => Err(Measurement::failed(&candidate.id, err.to_string())),
        }
    }
}

impl Measurer for BenchmarkExecutor {
    fn measure(&mut self, shape: &ProblemShape, candidate: &Candidate) -> Measurement {
        if let Err(err) = ensure_initialized(&self.device) {
            return Measurement::failed(&candidate.id, err.to_string());
        }

        let buffers = match self.alloc_buffers(shape) {
            Ok(buffers) => buffers,
            Err(err) => {
                return Measurement::failed(&candidate.id, format!("allocation failed: {err}"))
            }
        };
        let inputs = GemmInputs {
            a: &buffers.a,
            b: &buffers.b,
            bias: buffers.bias.as_ref(),
            scale_a: shape.scale_ab.then_some(0.5),
            scale_b: shape.scale_ab.then_some(2.0),
            out_dtype: shape.outdtype.to_candle(),
        };

        for _ in 0..self.warmup_iters {
            if let Err(measurement) = self.launch_once(candidate, &inputs) {
                return measurement;
            }
        }
        if let Err(err) = self.device.synchronize() {
            return Measurement::failed(&candidate.id, err.to_string());
        }

        let mut best_ns = f64::INFINITY;
        let mut last_out = None;
        for _ in 0..self.timed_iters {
            let start = Instant::now();
            let out = match self.launch_once(candidate, &inputs) {
                Ok(out) => out,
                Err(measurement) => return measurement,
            };
            if let Err(err) = self.device.synchronize() {
                return Measurement::failed(&candidate.id, err.to_string());
            }
            let elapsed_ns = start.elapsed().as_secs_f64() * 1e9;
            if elapsed_ns < best_ns {
                best_ns = elapsed_ns;
            }
            last_out = Some(out);
        }

        if let Some(out) = last_out {
            if !output_is_finite(&out) {
                return Measurement::failed(&candidate.id, "non-finite output (NaN/Inf)");
            }
        }

        debug!(
            shape = %shape,
            candidate = %candidate.id,
            latency_ns = best_ns,
            "measured"
        );
        Measurement::ok(&candidate.id, best_ns)
    }
}

/// NaN and Inf both propagate through a full-tensor sum, so a single scalar
/// readback validates the whole output.
fn output_is_finite(out: &Tensor) -> bool {
    let sum = out
        .to_dtype(DType::F32)
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_scalar::<f32>());
    match sum {
        Ok(value) => value.is_finite(),
        Err(_) => false,
    }
}
