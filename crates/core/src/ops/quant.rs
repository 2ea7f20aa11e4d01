//! Fused dynamic fp8 quantization bindings.
//!
//! Scale computation and cast happen in one call so callers never see an
//! intermediate scaled tensor. Scales are chosen so the largest magnitude
//! maps to the fp8 e4m3 maximum; dequantization is `q * scale`.

use candle_core::{DType, Result, Tensor};

/// Largest finite value representable in fp8 e4m3.
pub const FP8_E4M3_MAX: f64 = 448.0;

/// Guard against all-zero inputs producing a zero scale.
const MIN_SCALE: f64 = 1e-10;

/// Quantize a tensor to fp8 with one scale for the whole tensor.
///
/// Returns `(quantized, scale)`; `scale` is a scalar f32 tensor.
pub fn quantize_fp8_per_tensor(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let absmax = x
        .to_dtype(DType::F32)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()? as f64;
    let scale = (absmax / FP8_E4M3_MAX).max(MIN_SCALE);

    let quantized = (x.to_dtype(DType::F32)? / scale)?
        .clamp(-FP8_E4M3_MAX, FP8_E4M3_MAX)?
        .to_dtype(DType::F8E4M3)?;
    let scale = Tensor::new(scale as f32, x.device())?;
    Ok((quantized, scale))
}

/// Quantize a `[num_tokens, hidden]` activation tensor to fp8 with one
/// scale per token row.
///
/// Returns `(quantized, scales)` with `scales` shaped `[num_tokens, 1]`.
pub fn quantize_fp8_per_token(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let (_num_tokens, _hidden) = x.dims2()?;
    let x_f32 = x.to_dtype(DType::F32)?;
    let scales = (x_f32.abs()?.max_keepdim(1)? / FP8_E4M3_MAX)?.maximum(MIN_SCALE)?;

    let quantized = x_f32
        .broadcast_div(&scales)?
        .clamp(-FP8_E4M3_MAX, FP8_E4M3_MAX)?
        .to_dtype(DType::F8E4M3)?;
    Ok((quantized, scales))
}

/// Dequantize fp8 values back to f32 with a broadcastable scale.
pub fn dequantize_fp8(quantized: &Tensor, scale: &Tensor) -> Result<Tensor> {
    quantized.to_dtype(DType::F32)?.broadcast_mul(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_per_tensor_scale_is_absmax_over_fp8_max() {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![-224.0f32, 112.0, 56.0, 0.0], (2, 2), &device).unwrap();
        let (quantized, scale) = quantize_fp8_per_tensor(&x).unwrap();
        assert_eq!(quantized.dtype(), DType::F8E4M3);
        let scale: f32 = scale.to_scalar().unwrap();
        assert!((scale - 224.0 / 448.0).abs() < 1e-6);
    }

    #[test]
    fn test_per_tensor_round_trip_within_fp8_tolerance() {
        let device = Device::Cpu;
        let values: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 0.5).collect();
        let x = Tensor::from_vec(values.clone(), (4, 8), &device).unwrap();
        let (quantized, scale) = quantize_fp8_per_tensor(&x).unwrap();
        let restored: Vec<f32> = dequantize_fp8(&quantized, &scale)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        // fp8 e4m3 has ~2 mantissa bits of precision at this range
        for (orig, back) in values.iter().zip(restored.iter()) {
            assert!(
                (orig - back).abs() <= 0.125 * orig.abs().max(1.0),
                "{orig} round-tripped to {back}"
            );
        }
    }

    #[test]
    fn test_per_token_scales_are_rowwise() {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![448.0f32, -224.0, 44.8, 22.4], (2, 2), &device).unwrap();
        let (quantized, scales) = quantize_fp8_per_token(&x).unwrap();
        assert_eq!(quantized.dims(), &[2, 2]);
        assert_eq!(scales.dims(), &[2, 1]);

        let scales: Vec<f32> = scales.flatten_all().unwrap().to_vec1().unwrap();
        assert!((scales[0] - 1.0).abs() < 1e-6);
        assert!((scales[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_zero_input_does_not_divide_by_zero() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let (quantized, _scales) = quantize_fp8_per_token(&x).unwrap();
        let values: Vec<f32> = quantized
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }
}
