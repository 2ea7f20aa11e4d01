//! GEMM autotuning engine and GPU kernel bindings.
//!
//! The tuning pipeline: a [`shape::ShapeRegistry`] collects the problem
//! shapes to tune, the [`catalog::CandidateCatalog`] enumerates applicable
//! kernel configurations per shape, the [`bench::BenchmarkExecutor`] times
//! each candidate on-device, and the [`search::SearchController`] selects
//! the winner and persists it through the [`store::ResultStore`] so a
//! runtime dispatcher can pick it up without re-measuring.
//!
//! The [`ops`] module binds the compute kernels themselves (GEMM families,
//! RMS normalization, MoE routing/dispatch, fused quantization) as candle
//! ops.

pub mod bench;
pub mod catalog;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod search;
pub mod shape;
pub mod shape_source;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bench::{ensure_initialized, BenchmarkExecutor, MeasureStatus, Measurement, Measurer};
pub use catalog::{Candidate, CandidateCatalog, ConfigParams, FamilyRule, KernelFamily};
pub use dtype::DtypeKind;
pub use error::TuneError;
pub use search::{
    DecodeFamilyPolicy, RunSummary, SearchController, SearchState, SelectionPolicy, ShapeSearch,
    TuneWarning,
};
pub use shape::{ProblemShape, ShapeRegistry};
pub use shape_source::{
    generate_default_shapes, generate_model_shapes, load_shape_file, ModelConfig,
    ShapeSourceOptions, DEFAULT_NSETS,
};
pub use store::{ResultStore, TuningResult};
