//! Configuration options shared by all attention implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Hide keys that lie in the future of each query.
    ///
    /// When a cache prefix is present, queries align with the most recent keys
    /// so every query still sees the whole prefix.
    pub causal: bool,
    /// Multiplier applied to `q · k`; defaults to `1 / sqrt(head_dim)`.
    pub softmax_scale: Option<f64>,
}

impl Config {
    pub fn causal() -> Self {
        Self {
            causal: true,
            softmax_scale: None,
        }
    }

    /// Scale applied to attention scores for the given head width.
    pub fn scale_for(&self, head_dim: usize) -> f64 {
        self.softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f64).sqrt())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::causal()
    }
}
