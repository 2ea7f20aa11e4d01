//! Mixture-of-experts routing and dispatch bindings.
//!
//! Three ops cover the MoE data path around the expert GEMMs:
//!
//! 1. [`topk_softmax`] turns router logits into per-token expert weights
//!    and indices.
//! 2. [`moe_align_block_size`] groups token slots by expert and pads each
//!    expert's span to a block boundary, producing the gather indices the
//!    grouped expert GEMM consumes.
//! 3. [`moe_sum`] combines the per-expert outputs back into one hidden
//!    state per token.

use candle_core::{DType, Result, Tensor};

/// Softmax over expert logits followed by top-k selection.
///
/// `gating` is `[num_tokens, num_experts]`. Returns `(weights, indices)`,
/// both `[num_tokens, k]`; weights are renormalized to sum to 1 per token
/// when `renormalize` is set.
pub fn topk_softmax(gating: &Tensor, k: usize, renormalize: bool) -> Result<(Tensor, Tensor)> {
    let (_num_tokens, num_experts) = gating.dims2()?;
    if k == 0 || k > num_experts {
        candle_core::bail!("top-k {k} out of range for {num_experts} experts");
    }

    let probs = candle_nn::ops::softmax(&gating.to_dtype(DType::F32)?, candle_core::D::Minus1)?;
    let sorted = probs.arg_sort_last_dim(false)?;
    let topk_indices = sorted.narrow(1, 0, k)?.contiguous()?;
    let topk_weights = probs.gather(&topk_indices, 1)?;

    let weights = if renormalize {
        let sum = topk_weights.sum_keepdim(1)?;
        topk_weights.broadcast_div(&sum)?
    } else {
        topk_weights
    };
    Ok((weights, topk_indices.to_dtype(DType::U32)?))
}

/// Token slots grouped by expert and padded to block boundaries.
#[derive(Debug)]
pub struct AlignedTokens {
    /// Gather index per output slot, `[num_tokens_padded]`. Padding slots
    /// hold `num_valid_tokens` as an out-of-range sentinel.
    pub sorted_token_ids: Tensor,
    /// Expert processed by each block, `[num_tokens_padded / block_size]`.
    pub expert_ids: Tensor,
    /// Total slot count after padding.
    pub num_tokens_post_padded: usize,
    /// Valid (unpadded) slot count: `num_tokens * top_k`.
    pub num_valid_tokens: usize,
}

/// Group token slots by their expert assignment and pad each expert's span
/// so every block of `block_size` slots belongs to exactly one expert.
///
/// `topk_ids` is `[num_tokens, top_k]` of u32 expert indices.
pub fn moe_align_block_size(
    topk_ids: &Tensor,
    num_experts: usize,
    block_size: usize,
) -> Result<AlignedTokens> {
    if block_size == 0 {
        candle_core::bail!("block_size must be positive");
    }
    let device = topk_ids.device();
    let (num_tokens, top_k) = topk_ids.dims2()?;
    let num_valid_tokens = num_tokens * top_k;

    let flat: Vec<u32> = topk_ids.flatten_all()?.to_dtype(DType::U32)?.to_vec1()?;

    let mut per_expert: Vec<Vec<u32>> = vec![Vec::new(); num_experts];
    for (slot, &expert) in flat.iter().enumerate() {
        let expert = expert as usize;
        if expert >= num_experts {
            candle_core::bail!("expert index {expert} out of range for {num_experts} experts");
        }
        per_expert[expert].push(slot as u32);
    }

    let pad_sentinel = num_valid_tokens as u32;
    let mut sorted_token_ids = Vec::with_capacity(num_valid_tokens);
    let mut expert_ids = Vec::new();
    for (expert, slots) in per_expert.iter().enumerate() {
        if slots.is_empty() {
            continue;
        }
        let padded = slots.len().div_ceil(block_size) * block_size;
        sorted_token_ids.extend_from_slice(slots);
        sorted_token_ids.extend(std::iter::repeat(pad_sentinel).take(padded - slots.len()));
        expert_ids.extend(std::iter::repeat(expert as u32).take(padded / block_size));
    }

    let num_tokens_post_padded = sorted_token_ids.len();
    let sorted_len = sorted_token_ids.len();
    let expert_len = expert_ids.len();
    Ok(AlignedTokens {
        sorted_token_ids: Tensor::from_vec(sorted_token_ids, sorted_len, device)?,
        expert_ids: Tensor::from_vec(expert_ids, expert_len, device)?,
        num_tokens_post_padded,
        num_valid_tokens,
    })
}

/// Weighted combine of per-expert outputs.
///
/// `expert_out` is `[num_tokens, top_k, hidden]`, `weights` is
/// `[num_tokens, top_k]`. Returns `[num_tokens, hidden]`.
pub fn moe_sum(expert_out: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let (num_tokens, top_k, _hidden) = expert_out.dims3()?;
    let (w_tokens, w_k) = weights.dims2()?;
    if (num_tokens, top_k) != (w_tokens, w_k) {
        candle_core::bail!(
            "expert output [{num_tokens}, {top_k}, _] does not match weights [{w_tokens}, {w_k}]"
        );
    }
    let weights = weights.to_dtype(expert_out.dtype())?.unsqueeze(2)?;
    expert_out.broadcast_mul(&weights)?.sum(1)
}
