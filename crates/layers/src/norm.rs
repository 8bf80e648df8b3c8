//! Layer normalisation with unified shape and dtype handling.
//!
//! Normalisation happens along the last axis while preserving the original
//! layout, so `(batch, seq, hidden)` activations and flattened `(rows, hidden)`
//! buffers are both accepted. Statistics (mean, variance) are promoted to
//! [`PrecisionPolicy::reduction`] before the output is cast back to the
//! storage dtype.

use candle_core::{Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Normalises `hidden` over its last axis and applies `weight`/`bias`.
///
/// The result is produced in `policy.storage()`.
pub fn layer_norm(
    hidden: &Tensor,
    weight: &Tensor,
    bias: &Tensor,
    epsilon: f64,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let width = match hidden.dims().last() {
        Some(width) if *width > 0 => *width,
        _ => {
            return Err(Error::Msg(format!(
                "norm.input: expected a non-empty last axis, got {:?}",
                hidden.dims()
            )))
        }
    };
    checks::expect_shape("norm.weight", weight, &[width])?;
    checks::expect_shape("norm.bias", bias, &[width])?;

    let hidden_size = width as f64;
    let compute = policy.cast_for_reduction(hidden)?;
    let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
    let centered = compute.broadcast_sub(&mean)?;
    let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
    let denom = (variance + epsilon)?.sqrt()?;
    let normalized = centered.broadcast_div(&denom)?;

    let weight = weight.to_dtype(normalized.dtype())?;
    let bias = bias.to_dtype(normalized.dtype())?;
    let scaled = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;

    policy.cast_to_storage(&scaled)
}
