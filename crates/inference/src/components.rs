//! Interfaces of the attention and MLP sub-modules owned by a layer.

use std::sync::Arc;

use attention::LayerPast;
use candle_core::{Device, Tensor};
use kernels::InferenceKernels;

use crate::{comm::ParallelGroup, config::InferenceConfig, error::Result};

/// Quantization parameters shared by a layer's sub-modules.
///
/// The layer only carries these through to the builders; the arithmetic
/// belongs to the kernel library.
#[derive(Debug, Clone)]
pub struct QuantizationSettings {
    pub scales: Option<Tensor>,
    pub groups: usize,
    pub merge_count: usize,
    /// The MLP uses twice as many groups as attention.
    pub mlp_extra_grouping: bool,
    pub qkv_merging: bool,
}

impl QuantizationSettings {
    /// Settings seen by the MLP builder.
    pub fn for_mlp(&self) -> Self {
        let mut settings = self.clone();
        if self.mlp_extra_grouping {
            settings.groups *= 2;
        }
        settings
    }
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            scales: None,
            groups: 1,
            merge_count: 1,
            mlp_extra_grouping: false,
            qkv_merging: false,
        }
    }
}

/// Everything a builder needs to construct one sub-module.
pub struct BuildContext<'a> {
    pub config: &'a Arc<InferenceConfig>,
    pub group: &'a ParallelGroup,
    pub quantization: &'a QuantizationSettings,
    pub kernels: &'a Arc<dyn InferenceKernels>,
    pub device: &'a Device,
    pub layer_index: usize,
}

/// Arguments of one attention call.
pub struct AttentionInputs<'a> {
    pub hidden: &'a Tensor,
    pub input_mask: Option<&'a Tensor>,
    pub head_mask: Option<&'a Tensor>,
    pub layer_past: Option<&'a LayerPast>,
    pub get_present: bool,
    pub encoder_hidden_states: Option<&'a Tensor>,
    pub encoder_attention_mask: Option<&'a Tensor>,
    pub output_attentions: bool,
    /// The layer's own norm parameters, used for the input normalisation.
    pub norm_weight: &'a Tensor,
    pub norm_bias: &'a Tensor,
    pub alibi: Option<&'a Tensor>,
}

/// What attention hands back to the layer.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Projected attention output, `[batch, seq, hidden]`.
    pub output: Tensor,
    /// Keys covering the cached prefix and the new tokens.
    pub key: Tensor,
    pub value: Tensor,
    /// Merged per-head context before the output projection.
    pub context: Tensor,
    /// Input after the attention-side normalisation.
    pub input_norm: Tensor,
}

pub trait SelfAttention: Send {
    fn forward(&self, inputs: AttentionInputs<'_>) -> Result<AttentionOutput>;

    /// Bias of the output projection, added by the MLP's residual.
    fn output_bias(&self) -> &Tensor;
}

pub trait FeedForwardBlock: Send {
    fn forward(
        &self,
        attention_output: &Tensor,
        input: &Tensor,
        input_norm: &Tensor,
        attention_bias: &Tensor,
    ) -> Result<Tensor>;
}

/// Constructs the sub-modules of each layer.
pub trait ComponentBuilder: Send + Sync {
    fn build_attention(&self, ctx: &BuildContext<'_>) -> Result<Box<dyn SelfAttention>>;

    fn build_mlp(&self, ctx: &BuildContext<'_>) -> Result<Box<dyn FeedForwardBlock>>;
}
