use attention::AttentionError;
use kernels::KernelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Config(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl InferenceError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for InferenceError {
    fn from(value: toml::de::Error) -> Self {
        InferenceError::Config(value.to_string())
    }
}

impl From<serde_json::Error> for InferenceError {
    fn from(value: serde_json::Error) -> Self {
        InferenceError::Config(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
