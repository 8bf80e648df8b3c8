//! Per-layer inference configuration.
//!
//! Configurations are read from TOML or JSON (picked by file extension), then
//! environment overrides are applied, then every field is validated at once so
//! a bad file reports all of its problems together.

use std::{fs, path::Path};

use candle_core::DType;
use kernels::{KernelSource, DEFAULT_WORKSPACE_BUDGET, KERNEL_LIB_ENV};
use layers::{ActivationKind, PrecisionMode};
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};

pub const PRECISION_ENV: &str = "INFERENCE_PRECISION";
pub const MP_SIZE_ENV: &str = "INFERENCE_MP_SIZE";
pub const MAX_OUT_TOKENS_ENV: &str = "INFERENCE_MAX_OUT_TOKENS";

pub const DEFAULT_LAYER_NORM_EPS: f64 = 1e-12;
pub const DEFAULT_MAX_OUT_TOKENS: usize = 1024;

fn default_layer_norm_eps() -> f64 {
    DEFAULT_LAYER_NORM_EPS
}

fn default_one() -> usize {
    1
}

fn default_max_out_tokens() -> usize {
    DEFAULT_MAX_OUT_TOKENS
}

fn default_true() -> bool {
    true
}

fn default_workspace_budget() -> usize {
    DEFAULT_WORKSPACE_BUDGET
}

/// Settings shared by every sub-module of one transformer layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub hidden_size: usize,
    /// MLP width; `4 * hidden_size` when omitted.
    #[serde(default)]
    pub intermediate_size: Option<usize>,
    /// Attention heads before the tensor-parallel split.
    pub heads: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub precision: PrecisionMode,
    /// Tensor-parallel degree.
    #[serde(default = "default_one")]
    pub mp_size: usize,
    /// Upper bound on prompt plus generated tokens.
    #[serde(default = "default_max_out_tokens")]
    pub max_out_tokens: usize,
    #[serde(default = "default_true")]
    pub pre_layer_norm: bool,
    #[serde(default = "default_true")]
    pub return_tuple: bool,
    /// `false` selects the parallel residual where attention and MLP both
    /// read the normalised input.
    #[serde(default = "default_true")]
    pub mlp_after_attn: bool,
    #[serde(default)]
    pub activation: ActivationKind,
    #[serde(default = "default_true")]
    pub triangular_masking: bool,
    /// The key/value cache is kept outside the workspace.
    #[serde(default)]
    pub external_cache: bool,
    #[serde(default)]
    pub kernels: KernelSource,
    #[serde(default = "default_workspace_budget")]
    pub workspace_budget_bytes: usize,
}

impl InferenceConfig {
    /// Configuration with defaults for everything except the layer shape.
    pub fn new(hidden_size: usize, heads: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size: None,
            heads,
            layer_norm_eps: DEFAULT_LAYER_NORM_EPS,
            precision: PrecisionMode::default(),
            mp_size: 1,
            max_out_tokens: DEFAULT_MAX_OUT_TOKENS,
            pre_layer_norm: true,
            return_tuple: true,
            mlp_after_attn: true,
            activation: ActivationKind::default(),
            triangular_masking: true,
            external_cache: false,
            kernels: KernelSource::default(),
            workspace_budget_bytes: DEFAULT_WORKSPACE_BUDGET,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: InferenceConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(InferenceError::Config(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `INFERENCE_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(PRECISION_ENV) {
            self.precision = value
                .parse()
                .map_err(|err: String| InferenceError::Config(format!("{PRECISION_ENV}: {err}")))?;
        }
        if let Some(value) = lookup(MP_SIZE_ENV) {
            self.mp_size = parse_usize(MP_SIZE_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_OUT_TOKENS_ENV) {
            self.max_out_tokens = parse_usize(MAX_OUT_TOKENS_ENV, &value)?;
        }
        self.kernels = std::mem::take(&mut self.kernels).with_override(lookup(KERNEL_LIB_ENV));
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }
        if self.heads == 0 {
            errors.push("heads must be greater than 0".to_string());
        } else if self.hidden_size % self.heads != 0 {
            errors.push(format!(
                "hidden_size ({}) must be divisible by heads ({})",
                self.hidden_size, self.heads
            ));
        }
        if self.mp_size == 0 {
            errors.push("mp_size must be greater than 0".to_string());
        } else {
            if self.heads % self.mp_size != 0 {
                errors.push(format!(
                    "heads ({}) must be divisible by mp_size ({})",
                    self.heads, self.mp_size
                ));
            }
            if self.intermediate_size() % self.mp_size != 0 {
                errors.push(format!(
                    "intermediate_size ({}) must be divisible by mp_size ({})",
                    self.intermediate_size(),
                    self.mp_size
                ));
            }
        }
        if let Some(0) = self.intermediate_size {
            errors.push("intermediate_size must be greater than 0".to_string());
        }
        if self.layer_norm_eps.is_nan() || self.layer_norm_eps <= 0.0 {
            errors.push("layer_norm_eps must be positive".to_string());
        }
        if self.max_out_tokens == 0 {
            errors.push("max_out_tokens must be greater than 0".to_string());
        }
        if self.workspace_budget_bytes == 0 {
            errors.push("workspace_budget_bytes must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(InferenceError::validation(errors));
        }
        Ok(())
    }

    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.hidden_size)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.heads
    }

    /// Heads held by one tensor-parallel rank.
    pub fn local_heads(&self) -> usize {
        self.heads / self.mp_size
    }

    /// Dtype of layer-owned parameters.
    pub fn parameter_dtype(&self) -> DType {
        self.precision.parameter_dtype()
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|err| InferenceError::Config(format!("{key}={value:?}: {err}")))
}
