//! Normalises caller supplied attention masks into the additive layout.

use candle_core::{DType, Result, Tensor};

use super::MASK_DTYPE;

/// Value used for discarded positions when converting keep/drop masks.
pub const MASKED_SCORE: f32 = -10_000.0;

/// Expands `mask` to `[batch, num_heads, q_len, k_len]` in [`MASK_DTYPE`].
///
/// * Rank-2 masks shaped `[batch, k_len]` hold `1` for tokens to keep and `0`
///   for padding; they are converted to additive form.
/// * Rank-4 masks are taken as already additive and broadcast over any
///   singleton axes (`[batch, 1, 1, k_len]` is the common case).
pub fn expand_attention_mask(
    mask: &Tensor,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let target = (batch, num_heads, q_len, k_len);
    match mask.rank() {
        2 => {
            let keep = mask.to_dtype(DType::F32)?;
            // (1 - keep) * MASKED_SCORE
            let additive = keep.affine(-(MASKED_SCORE as f64), MASKED_SCORE as f64)?;
            additive
                .reshape((batch, 1, 1, k_len))?
                .broadcast_as(target)?
                .contiguous()
        }
        4 => mask
            .to_dtype(MASK_DTYPE)?
            .broadcast_as(target)?
            .contiguous(),
        rank => Err(candle_core::Error::Msg(format!(
            "attention mask must be rank 2 or 4, got rank {rank} with dims {:?}",
            mask.dims()
        ))),
    }
}
