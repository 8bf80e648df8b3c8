//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `name` describing the tensor being checked so error
//! messages point at the offending parameter. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has the expected number of dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Rejects strided views where a dense buffer is required.
pub fn expect_contiguous(name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{name}: tensor must be contiguous")))
    }
}

/// Floating point dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: [DType; 3] = [DType::F16, DType::BF16, DType::F32];
