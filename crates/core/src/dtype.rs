//! Closed set of data types the tuner understands.
//!
//! Dtype strings arrive from three places: CLI flags, input shape files, and
//! the `torch_dtype` field of a model's `config.json`. All three go through
//! the same total lookup, which fails with [`TuneError::UnknownDtype`] on
//! anything unrecognized. The legacy warn-and-default-to-f16 behavior is
//! available behind [`DtypeKind::parse_lenient`] for old shape files.

use std::fmt;
use std::str::FromStr;

use candle_core::DType;
use tracing::warn;

use crate::error::TuneError;

/// Element type of a GEMM operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtypeKind {
    F32,
    F16,
    Bf16,
    Fp8,
}

impl DtypeKind {
    /// All dtypes the tuner accepts, in declaration order.
    pub const ALL: [DtypeKind; 4] = [
        DtypeKind::F32,
        DtypeKind::F16,
        DtypeKind::Bf16,
        DtypeKind::Fp8,
    ];

    /// Canonical string form, matching the CLI choices.
    pub fn as_str(&self) -> &'static str {
        match self {
            DtypeKind::F32 => "f32",
            DtypeKind::F16 => "f16",
            DtypeKind::Bf16 => "bf16",
            DtypeKind::Fp8 => "fp8",
        }
    }

    /// Storage dtype used when allocating benchmark buffers.
    pub fn to_candle(self) -> DType {
        match self {
            DtypeKind::F32 => DType::F32,
            DtypeKind::F16 => DType::F16,
            DtypeKind::Bf16 => DType::BF16,
            DtypeKind::Fp8 => DType::F8E4M3,
        }
    }

    /// Dtype the kernels actually accumulate in.
    ///
    /// fp8 operands are upcast to bf16 before the matmul, following the
    /// vendor BLAS convention; everything else computes in its storage type.
    pub fn compute_dtype(self) -> DType {
        match self {
            DtypeKind::Fp8 => DType::BF16,
            other => other.to_candle(),
        }
    }

    /// Total lookup from a dtype string.
    ///
    /// Accepts the short names (`f16`), the torch long names (`float16`,
    /// `bfloat16`), and a `torch.` prefix as found in model configs.
    pub fn parse(s: &str) -> Result<Self, TuneError> {
        let name = s.trim();
        let name = name.strip_prefix("torch.").unwrap_or(name);
        match name {
            "f32" | "fp32" | "float32" | "float" => Ok(DtypeKind::F32),
            "f16" | "fp16" | "float16" | "half" => Ok(DtypeKind::F16),
            "bf16" | "bfloat16" => Ok(DtypeKind::Bf16),
            "fp8" | "f8" | "f8e4m3" | "float8_e4m3fn" => Ok(DtypeKind::Fp8),
            _ => Err(TuneError::UnknownDtype(s.to_string())),
        }
    }

    /// Legacy lookup: unknown strings warn and fall back to f16.
    ///
    /// Matches the behavior of the original tuner so that shape files
    /// collected with it keep loading; new runs should prefer the fatal
    /// [`DtypeKind::parse`].
    pub fn parse_lenient(s: &str) -> Self {
        match Self::parse(s) {
            Ok(dtype) => dtype,
            Err(_) => {
                warn!(dtype = %s, "invalid dtype, using default dtype f16");
                DtypeKind::F16
            }
        }
    }
}

impl fmt::Display for DtypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DtypeKind {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_names() {
        assert_eq!(DtypeKind::parse("f32").unwrap(), DtypeKind::F32);
        assert_eq!(DtypeKind::parse("f16").unwrap(), DtypeKind::F16);
        assert_eq!(DtypeKind::parse("bf16").unwrap(), DtypeKind::Bf16);
        assert_eq!(DtypeKind::parse("fp8").unwrap(), DtypeKind::Fp8);
    }

    #[test]
    fn test_parse_torch_names() {
        assert_eq!(DtypeKind::parse("torch.float16").unwrap(), DtypeKind::F16);
        assert_eq!(DtypeKind::parse("torch.bfloat16").unwrap(), DtypeKind::Bf16);
        assert_eq!(DtypeKind::parse("bfloat16").unwrap(), DtypeKind::Bf16);
        assert_eq!(
            DtypeKind::parse("float8_e4m3fn").unwrap(),
            DtypeKind::Fp8
        );
    }

    #[test]
    fn test_parse_unknown_is_fatal() {
        let err = DtypeKind::parse("int4").unwrap_err();
        assert!(matches!(err, TuneError::UnknownDtype(s) if s == "int4"));
    }

    #[test]
    fn test_parse_lenient_defaults_to_f16() {
        assert_eq!(DtypeKind::parse_lenient("int4"), DtypeKind::F16);
        assert_eq!(DtypeKind::parse_lenient("bf16"), DtypeKind::Bf16);
    }

    #[test]
    fn test_display_round_trips() {
        for dtype in DtypeKind::ALL {
            assert_eq!(DtypeKind::parse(dtype.as_str()).unwrap(), dtype);
        }
    }

    #[test]
    fn test_fp8_computes_in_bf16() {
        assert_eq!(DtypeKind::Fp8.compute_dtype(), DType::BF16);
        assert_eq!(DtypeKind::F16.compute_dtype(), DType::F16);
    }
}
