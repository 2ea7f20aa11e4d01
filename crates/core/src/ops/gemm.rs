//! GEMM kernel implementations behind the tuning boundary.
//!
//! Every candidate the catalog hands to the benchmark executor wraps one of
//! these kernels. The contract is asynchronous-launch-then-synchronize: a
//! kernel queues its work on the device and returns; the executor owns the
//! synchronization point. Epilogue handling (scaleA/scaleB, bias add, output
//! dtype cast) is shared so that every family implements the same
//! input/output contract.

use candle_core::{DType, Tensor};
use thiserror::Error;

/// Kernel-level failure classes.
///
/// `ShapeMismatch` means the applicability predicate lied: the catalog
/// offered this kernel a problem it cannot express. The executor maps it to
/// a Skipped measurement and reports a catalog inconsistency. Everything
/// else is an ordinary candidate failure.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("kernel launch failed: {0}")]
    Launch(#[from] candle_core::Error),

    #[error("allocation failed: {0}")]
    Alloc(String),
}

/// Operands for one GEMM invocation.
///
/// `a` is `[m, k]`, `b` is `[k, n]`, `bias` (when present) is `[n]` and is
/// added to every output row after the output dtype cast. `scale_a` and
/// `scale_b` multiply the accumulated product before the cast.
pub struct GemmInputs<'a> {
    pub a: &'a Tensor,
    pub b: &'a Tensor,
    pub bias: Option<&'a Tensor>,
    pub scale_a: Option<f64>,
    pub scale_b: Option<f64>,
    pub out_dtype: DType,
}

impl GemmInputs<'_> {
    fn check_dims(&self) -> Result<(), KernelError> {
        let a_dims = self.a.dims();
        let b_dims = self.b.dims();
        if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[1] != b_dims[0] {
            return Err(KernelError::ShapeMismatch {
                expected: "[m,k] x [k,n]".to_string(),
                got: format!("{a_dims:?} x {b_dims:?}"),
            });
        }
        Ok(())
    }

    /// Operands in the dtype the matmul runs in. fp8 storage is upcast to
    /// bf16; other dtypes pass through untouched.
    fn compute_operands(&self) -> Result<(Tensor, Tensor), KernelError> {
        if self.a.dtype() == DType::F8E4M3 {
            let a = self.a.to_dtype(DType::BF16)?;
            let b = self.b.to_dtype(DType::BF16)?;
            Ok((a, b))
        } else {
            Ok((self.a.clone(), self.b.clone()))
        }
    }

    /// Scale, cast to the output dtype, and add bias.
    fn epilogue(&self, out: Tensor) -> Result<Tensor, KernelError> {
        let mut out = out;
        let scale = match (self.scale_a, self.scale_b) {
            (Some(a), Some(b)) => Some(a * b),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        if let Some(scale) = scale {
            out = (out * scale)?;
        }
        out = out.to_dtype(self.out_dtype)?;
        if let Some(bias) = self.bias {
            out = out.broadcast_add(&bias.to_dtype(self.out_dtype)?)?;
        }
        Ok(out)
    }
}

/// One concrete GEMM implementation eligible for tuning.
///
/// `launch` queues the computation on the tensor's device and returns the
/// (possibly not yet materialized) output; the benchmark executor
/// synchronizes the device before stopping its timer.
pub trait GemmKernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn launch(&self, inputs: &GemmInputs<'_>) -> Result<Tensor, KernelError>;
}

/// Vendor-library dense GEMM: a single device BLAS call.
pub struct DenseGemm;

impl GemmKernel for DenseGemm {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn launch(&self, inputs: &GemmInputs<'_>) -> Result<Tensor, KernelError> {
        inputs.check_dims()?;
        let (a, b) = inputs.compute_operands()?;
        let out = a.matmul(&b)?;
        inputs.epilogue(out)
    }
}

/// Vendor-library batched GEMM: the strided-batched path with a singleton
/// batch dimension. Carries no bias or scale epilogue; the catalog must not
/// offer it such shapes.
pub struct BatchedGemm;

impl GemmKernel for BatchedGemm {
    fn name(&self) -> &'static str {
        "batched"
    }

    fn launch(&self, inputs: &GemmInputs<'_>) -> Result<Tensor, KernelError> {
        inputs.check_dims()?;
        if inputs.bias.is_some() || inputs.scale_a.is_some() || inputs.scale_b.is_some() {
            return Err(KernelError::ShapeMismatch {
                expected: "plain gemm without bias or scaleAB".to_string(),
                got: "epilogue inputs present".to_string(),
            });
        }
        let (a, b) = inputs.compute_operands()?;
        let out = a.unsqueeze(0)?.matmul(&b.unsqueeze(0)?)?.squeeze(0)?;
        Ok(out.to_dtype(inputs.out_dtype)?)
    }
}

/// Custom tiled GEMM: splits the K dimension into `split_k` chunks whose
/// partial products are accumulated, computing each chunk in N-tiles of
/// `tile_n` columns.
pub struct SplitKGemm {
    split_k: usize,
    tile_n: usize,
}

impl SplitKGemm {
    pub fn new(split_k: usize, tile_n: usize) -> Self {
        Self {
            split_k: split_k.max(1),
            tile_n: tile_n.max(1),
        }
    }

    fn tiled_matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, KernelError> {
        let n = b.dims()[1];
        if n <= self.tile_n {
            return Ok(a.matmul(b)?);
        }
        let mut tiles = Vec::with_capacity(n.div_ceil(self.tile_n));
        let mut start = 0;
        while start < n {
            let len = self.tile_n.min(n - start);
            let b_tile = b.narrow(1, start, len)?;
            tiles.push(a.matmul(&b_tile)?);
            start += len;
        }
        Ok(Tensor::cat(&tiles, 1)?)
    }
}

impl GemmKernel for SplitKGemm {
    fn name(&self) -> &'static str {
        "splitk"
    }

    fn launch(&self, inputs: &GemmInputs<'_>) -> Result<Tensor, KernelError> {
        inputs.check_dims()?;
        let (a, b) = inputs.compute_operands()?;
        let k = a.dims()[1];
        let chunk = k.div_ceil(self.split_k);
        let mut acc: Option<Tensor> = None;
        let mut start = 0;
        while start < k {
            let len = chunk.min(k - start);
            let a_part = a.narrow(1, start, len)?.contiguous()?;
            let b_part = b.narrow(0, start, len)?.contiguous()?;
            let partial = self.tiled_matmul(&a_part, &b_part)?;
            acc = Some(match acc {
                Some(sum) => (sum + partial)?,
                None => partial,
            });
            start += len;
        }
        // chunk >= 1 and k >= 1, so the loop body ran at least once
        match acc {
            Some(out) => inputs.epilogue(out),
            None => Err(KernelError::ShapeMismatch {
                expected: "k > 0".to_string(),
                got: "empty K dimension".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn make_inputs(m: usize, n: usize, k: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let a: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.03).sin()).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i as f32 * 0.05).cos()).collect();
        (
            Tensor::from_vec(a, (m, k), &device).unwrap(),
            Tensor::from_vec(b, (k, n), &device).unwrap(),
        )
    }

    fn assert_close(lhs: &Tensor, rhs: &Tensor, tol: f32) {
        let lhs: Vec<f32> = lhs.flatten_all().unwrap().to_vec1().unwrap();
        let rhs: Vec<f32> = rhs.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(lhs.len(), rhs.len());
        for (i, (x, y)) in lhs.iter().zip(rhs.iter()).enumerate() {
            assert!((x - y).abs() < tol, "mismatch at {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_dense_matches_reference() {
        let (a, b) = make_inputs(8, 6, 16);
        let inputs = GemmInputs {
            a: &a,
            b: &b,
            bias: None,
            scale_a: None,
            scale_b: None,
            out_dtype: DType::F32,
        };
        let out = DenseGemm.launch(&inputs).unwrap();
        assert_eq!(out.dims(), &[8, 6]);
        assert_close(&out, &a.matmul(&b).unwrap(), 1e-5);
    }

    #[test]
    fn test_splitk_matches_dense() {
        let (a, b) = make_inputs(16, 300, 64);
        let inputs = GemmInputs {
            a: &a,
            b: &b,
            bias: None,
            scale_a: None,
            scale_b: None,
            out_dtype: DType::F32,
        };
        let reference = DenseGemm.launch(&inputs).unwrap();
        for (split_k, tile_n) in [(2, 128), (4, 128), (8, 256)] {
            let out = SplitKGemm::new(split_k, tile_n).launch(&inputs).unwrap();
            assert_eq!(out.dims(), &[16, 300]);
            assert_close(&out, &reference, 1e-4);
        }
    }

    #[test]
    fn test_batched_matches_dense() {
        let (a, b) = make_inputs(8, 6, 16);
        let inputs = GemmInputs {
            a: &a,
            b: &b,
            bias: None,
            scale_a: None,
            scale_b: None,
            out_dtype: DType::F32,
        };
        let dense = DenseGemm.launch(&inputs).unwrap();
        let batched = BatchedGemm.launch(&inputs).unwrap();
        assert_close(&batched, &dense, 1e-5);
    }

    #[test]
    fn test_bias_and_scale_epilogue() {
        let (a, b) = make_inputs(4, 5, 8);
        let bias = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0], 5, &Device::Cpu).unwrap();
        let inputs = GemmInputs {
            a: &a,
            b: &b,
            bias: Some(&bias),
            scale_a: Some(0.5),
            scale_b: Some(2.0),
            out_dtype: DType::F32,
        };
        let out = DenseGemm.launch(&inputs).unwrap();
        let expected = a
            .matmul(&b)
            .unwrap()
            .broadcast_add(&bias)
            .unwrap();
        // scale_a * scale_b == 1.0, so only the bias shifts the output
        assert_close(&out, &expected, 1e-5);
    }

    #[test]
    fn test_rank_mismatch_is_shape_mismatch() {
        let device = Device::Cpu;
        let a = Tensor::zeros((4, 4, 4), DType::F32, &device).unwrap();
        let b = Tensor::zeros((4, 4), DType::F32, &device).unwrap();
        let inputs = GemmInputs {
            a: &a,
            b: &b,
            bias: None,
            scale_a: None,
            scale_b: None,
            out_dtype: DType::F32,
        };
        let err = DenseGemm.launch(&inputs).unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_batched_rejects_bias() {
        let (a, b) = make_inputs(4, 4, 4);
        let bias = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let inputs = GemmInputs {
            a: &a,
            b: &b,
            bias: Some(&bias),
            scale_a: None,
            scale_b: None,
            out_dtype: DType::F32,
        };
        let err = BatchedGemm.launch(&inputs).unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_out_dtype_cast() {
        let (a, b) = make_inputs(4, 4, 4);
        let inputs = GemmInputs {
            a: &a,
            b: &b,
            bias: None,
            scale_a: None,
            scale_b: None,
            out_dtype: DType::F16,
        };
        let out = DenseGemm.launch(&inputs).unwrap();
        assert_eq!(out.dtype(), DType::F16);
    }
}
