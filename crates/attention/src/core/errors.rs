//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl AttentionError {
    pub fn invalid_shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}
