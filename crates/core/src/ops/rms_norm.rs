//! RMS normalization bindings.
//!
//! `RmsNorm` is a drop-in module over candle's fused rms-norm op. The
//! residual variant fuses the residual add that precedes normalization in
//! pre-norm transformer blocks, returning both the normalized output and
//! the updated residual stream so callers can feed the latter into the next
//! block.

use candle_core::{Module, Result, Tensor};

/// RMS normalization layer.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Fused residual-add variant: normalizes `x + residual` and returns
    /// `(normalized, x + residual)`.
    pub fn forward_residual(&self, x: &Tensor, residual: &Tensor) -> Result<(Tensor, Tensor)> {
        let summed = (x + residual)?;
        let normalized = self.forward(&summed)?;
        Ok((normalized, summed))
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&xs.contiguous()?, &self.weight, self.eps as f32)
    }
}
