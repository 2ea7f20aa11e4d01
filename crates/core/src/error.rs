//! Error taxonomy for the tuner.
//!
//! Config-class errors (`InvalidShape`, `UnknownDtype`, `MissingInputFile`,
//! `MalformedRow`, `ModelConfig`, `UnsupportedDtype`) abort a run before any
//! benchmarking starts. `Persistence` is fatal at flush time. Per-candidate
//! failures never appear here: they are recorded in
//! [`Measurement::status`](crate::bench::Measurement) and can only cost that
//! candidate its chance to win. Catalog inconsistencies are collected as
//! [`TuneWarning`](crate::search::TuneWarning) records in the run summary.

use std::path::PathBuf;

use thiserror::Error;

use crate::dtype::DtypeKind;

#[derive(Error, Debug)]
pub enum TuneError {
    #[error("invalid shape {m}x{n}x{k}: all dimensions must be positive")]
    InvalidShape { m: i64, n: i64, k: i64 },

    #[error("unknown dtype '{0}'")]
    UnknownDtype(String),

    #[error("model config does not specify torch_dtype and no input dtype was given")]
    MissingDtype,

    #[error("no kernel family supports dtype {0}")]
    UnsupportedDtype(DtypeKind),

    #[error("input file not found: {0}")]
    MissingInputFile(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed row at line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },

    #[error("model config at {path}: {reason}")]
    ModelConfig { path: PathBuf, reason: String },

    #[error("failed to persist tuned results to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_shape() {
        let e = TuneError::InvalidShape { m: 0, n: 1, k: 64 };
        assert_eq!(
            e.to_string(),
            "invalid shape 0x1x64: all dimensions must be positive"
        );
    }

    #[test]
    fn test_error_display_unknown_dtype() {
        let e = TuneError::UnknownDtype("int4".to_string());
        assert_eq!(e.to_string(), "unknown dtype 'int4'");
    }

    #[test]
    fn test_error_display_unsupported_dtype() {
        let e = TuneError::UnsupportedDtype(DtypeKind::Fp8);
        assert_eq!(e.to_string(), "no kernel family supports dtype fp8");
    }
}
