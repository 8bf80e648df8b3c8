//! Scaled dot-product attention primitives for the inference layer.
//!
//! Tensors follow the layout `[batch, n_heads, seq_len, head_dim]`. Queries,
//! keys and values share a dtype (bf16, f16, or f32); reductions are performed
//! in `f32` and the output matches the query dtype and shape.
//!
//! Decoding keeps the keys and values of earlier steps in a [`LayerPast`] so
//! later queries can attend over the cached prefix.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use crate::core::{Attention, AttentionError, Config, ScoreModifiers};
pub use crate::kv_cache::LayerPast;
pub use crate::reference::ExactAttention;
