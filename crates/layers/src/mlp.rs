//! Position-wise feed-forward block built on top of projections and activations.
//!
//! The MLP operates on hidden states shaped `(batch, seq, hidden)` and returns
//! the same layout. The intermediate projection expands the hidden dimension
//! to `config.intermediate_size`, applies an activation, then contracts back to
//! the model hidden size. Intermediate results stay in the compute dtype; only
//! the final projection is cast to the storage dtype.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
        }
    }
}

/// Two-projection MLP: `down(act(up(x)))`, both projections biased.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
}

impl FeedForward {
    /// Assembles the block from existing projections.
    pub fn new(config: FeedForwardConfig, up: Linear, down: Linear) -> Result<Self> {
        let up_cfg = up.config();
        let down_cfg = down.config();
        if up_cfg.input_dim != config.hidden_size
            || up_cfg.total_output_dim() != config.intermediate_size
            || down_cfg.input_dim != config.intermediate_size
            || down_cfg.total_output_dim() != config.hidden_size
        {
            return Err(candle_core::Error::Msg(format!(
                "feed-forward projections do not match hidden={} intermediate={}",
                config.hidden_size, config.intermediate_size
            )));
        }
        Ok(Self { config, up, down })
    }

    /// Builds the block with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let up = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            init,
            device,
            dtype,
        )?;
        let down = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        Self::new(config, up, down)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Performs the forward pass through the MLP.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let inner = policy.with_storage(policy.compute());
        let expanded = self.up.forward(hidden, &inner)?;
        let activated = self.config.activation.forward(&expanded, &inner)?;
        self.down.forward(&activated, policy)
    }
}
