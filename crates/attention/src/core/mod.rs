//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output mirrors the query layout
//! and dtype, while reductions accumulate in `f32` regardless of the incoming
//! dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Optional score modifiers accompanying a query block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreModifiers<'a> {
    /// Additive mask broadcastable to `[batch, heads, q_len, k_len]`, or a
    /// `[batch, k_len]` keep/drop mask of ones and zeros.
    pub attention_mask: Option<&'a Tensor>,
    /// Multiplicative per-head mask applied to the probabilities; shaped
    /// `[heads]` or broadcastable to `[batch, heads, q_len, k_len]`.
    pub head_mask: Option<&'a Tensor>,
    /// Positional bias added to the scores before softmax (ALiBi style),
    /// broadcastable to `[batch, heads, q_len, k_len]`.
    pub alibi: Option<&'a Tensor>,
}

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, heads, k_len, head_dim]` with `k_len >= q_len` when a cache
///   prefix is present.
/// * The returned tensor mirrors the layout and dtype of `q`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        modifiers: &ScoreModifiers<'_>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
