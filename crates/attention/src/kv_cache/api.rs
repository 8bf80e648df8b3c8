//! The key/value pair a layer carries between decoding steps.

use candle_core::{Result, Tensor};

/// Keys and values accumulated by one attention layer.
///
/// Both tensors share the layout `[batch, heads, seq_len, head_dim]`.
#[derive(Debug, Clone)]
pub struct LayerPast {
    pub key: Tensor,
    pub value: Tensor,
}

impl LayerPast {
    pub fn new(key: Tensor, value: Tensor) -> Self {
        Self { key, value }
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.key.dims().get(2).copied().unwrap_or(0)
    }

    /// Returns a new pair with `key`/`value` appended along the sequence axis.
    pub fn append(&self, key: &Tensor, value: &Tensor) -> Result<Self> {
        let key = Tensor::cat(&[&self.key, key], 2)?;
        let value = Tensor::cat(&[&self.value, value], 2)?;
        Ok(Self { key, value })
    }

    /// Splits the pair into its tensors.
    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.key, self.value)
    }
}

impl From<(Tensor, Tensor)> for LayerPast {
    fn from((key, value): (Tensor, Tensor)) -> Self {
        Self { key, value }
    }
}
