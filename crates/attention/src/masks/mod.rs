//! Mask utilities shared by attention implementations.
//!
//! All masks produced here are additive tensors with dtype `f32`, shaped
//! `[batch, num_heads, q_len, k_len]`. Values are either `0.0` (keep) or a
//! large negative number (discard).

pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::expand_attention_mask;
