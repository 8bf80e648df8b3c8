use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while loading or invoking a kernel capability set.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to load kernel library {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("kernel library {path} does not export `{symbol}`")]
    MissingSymbol { path: PathBuf, symbol: String },
    #[error("workspace allocation failed: {0}")]
    Workspace(String),
    #[error("native kernel `{symbol}` returned status {code}")]
    Native { symbol: &'static str, code: i32 },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
