//! Reference CPU attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::{Attention, AttentionError, Config, ScoreModifiers};
use crate::masks::{build_causal_mask, expand_attention_mask};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        modifiers: &ScoreModifiers<'_>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init causal={} scale={:?} device={:?}",
                config.causal,
                config.softmax_scale,
                q.device().location()
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::invalid_shape(
                "q, k, v must reside on the same device",
            ));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::invalid_shape(
                "q, k, v must share the same dtype",
            ));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q.dims4().map_err(|_| {
            AttentionError::invalid_shape("q must have shape [batch, heads, seq_len, head_dim]")
        })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| {
            AttentionError::invalid_shape("k must have shape [batch, heads, seq_len, head_dim]")
        })?;
        let (vb, vh, vk, vd) = v.dims4().map_err(|_| {
            AttentionError::invalid_shape("v must have shape [batch, heads, seq_len, head_dim]")
        })?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::invalid_shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::invalid_shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }
        if k_len < q_len {
            return Err(AttentionError::invalid_shape(format!(
                "key length {k_len} shorter than query length {q_len}"
            )));
        }

        let merged = batch * heads;
        let q_view = q
            .to_dtype(DType::F32)?
            .contiguous()?
            .reshape((merged, q_len, head_dim))?;
        let k_view = k
            .to_dtype(DType::F32)?
            .contiguous()?
            .reshape((merged, k_len, head_dim))?;
        let v_view = v
            .to_dtype(DType::F32)?
            .contiguous()?
            .reshape((merged, k_len, head_dim))?;

        let scale = config.scale_for(head_dim);
        let mut scores = q_view
            .matmul(&k_view.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .reshape((batch, heads, q_len, k_len))?;

        if let Some(alibi) = modifiers.alibi {
            scores = scores.broadcast_add(&alibi.to_dtype(DType::F32)?)?;
        }
        if config.causal {
            let causal = build_causal_mask(device, batch, heads, q_len, k_len)?;
            scores = scores.add(&causal)?;
        }
        if let Some(mask) = modifiers.attention_mask {
            if !device.same_device(mask.device()) {
                return Err(AttentionError::invalid_shape(
                    "mask must reside on the same device as q",
                ));
            }
            let additive = expand_attention_mask(mask, batch, heads, q_len, k_len)
                .map_err(|err| AttentionError::invalid_shape(err.to_string()))?;
            scores = scores.add(&additive)?;
        }

        let mut probs = softmax_last_dim(&scores)?;
        if let Some(head_mask) = modifiers.head_mask {
            let head_mask = head_mask.to_dtype(DType::F32)?;
            let head_mask = if head_mask.rank() == 1 {
                head_mask.reshape((1, heads, 1, 1))?
            } else {
                head_mask
            };
            probs = probs.broadcast_mul(&head_mask)?;
        }

        let output = probs
            .reshape((merged, q_len, k_len))?
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?;

        Ok(output.to_dtype(dtype)?)
    }
}
