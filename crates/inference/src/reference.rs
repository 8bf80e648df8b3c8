//! Candle implementations of the attention and MLP sub-modules.
//!
//! These run anywhere Candle does and are what [`LayerFactory`] builds by
//! default. Under tensor parallelism each rank holds `heads / mp_size` heads
//! and `intermediate_size / mp_size` MLP units; combining partial outputs
//! across ranks is left to the caller.
//!
//! [`LayerFactory`]: crate::LayerFactory

use std::sync::Arc;

use attention::{Attention, Config as AttentionConfig, ExactAttention, ScoreModifiers};
use candle_core::{bail, DType, Tensor};
use kernels::{InferenceKernels, WorkspaceKind};
use layers::{
    checks,
    dtypes::cast_tensor,
    linear::{Linear, LinearConfig, LinearInit},
    mlp::{FeedForward, FeedForwardConfig},
    PrecisionPolicy,
};

use crate::{
    components::{
        AttentionInputs, AttentionOutput, BuildContext, ComponentBuilder, FeedForwardBlock,
        SelfAttention,
    },
    config::InferenceConfig,
    error::{InferenceError, Result},
};

/// Self-attention with a fused QKV projection and a bias-free output
/// projection whose bias is exposed separately.
pub struct ReferenceSelfAttention {
    config: Arc<InferenceConfig>,
    kernels: Arc<dyn InferenceKernels>,
    norm_kind: WorkspaceKind,
    local_heads: usize,
    head_dim: usize,
    qkv: Linear,
    out: Linear,
    output_bias: Tensor,
    attention: ExactAttention,
    attention_config: AttentionConfig,
}

impl ReferenceSelfAttention {
    pub fn new(ctx: &BuildContext<'_>, init: &LinearInit) -> Result<Self> {
        let config = ctx.config;
        let dtype = config.parameter_dtype();
        let local_hidden = config.local_heads() * config.head_dim();

        let qkv_config = LinearConfig {
            input_dim: config.hidden_size,
            output_dim: local_hidden,
            bias: true,
            fused_projections: 3,
        };
        let qkv = Linear::with_init(qkv_config, init, ctx.device, dtype)?;

        let mut out_config = LinearConfig::new(local_hidden, config.hidden_size);
        out_config.bias = false;
        let out = Linear::with_init(out_config, init, ctx.device, dtype)?;
        let output_bias = Tensor::zeros(config.hidden_size, dtype, ctx.device)?;

        Self::from_parts(Arc::clone(config), Arc::clone(ctx.kernels), qkv, out, output_bias)
    }

    /// Assembles the module from loaded projections.
    pub fn from_parts(
        config: Arc<InferenceConfig>,
        kernels: Arc<dyn InferenceKernels>,
        qkv: Linear,
        out: Linear,
        output_bias: Tensor,
    ) -> Result<Self> {
        let local_heads = config.local_heads();
        let head_dim = config.head_dim();
        let local_hidden = local_heads * head_dim;

        let qkv_cfg = qkv.config();
        if qkv_cfg.input_dim != config.hidden_size || qkv_cfg.total_output_dim() != 3 * local_hidden
        {
            return Err(InferenceError::invalid_argument(format!(
                "qkv projection must map {} -> {}, got {} -> {}",
                config.hidden_size,
                3 * local_hidden,
                qkv_cfg.input_dim,
                qkv_cfg.total_output_dim()
            )));
        }
        let out_cfg = out.config();
        if out_cfg.input_dim != local_hidden || out_cfg.total_output_dim() != config.hidden_size {
            return Err(InferenceError::invalid_argument(format!(
                "output projection must map {} -> {}, got {} -> {}",
                local_hidden,
                config.hidden_size,
                out_cfg.input_dim,
                out_cfg.total_output_dim()
            )));
        }
        checks::expect_shape("attention.output_bias", &output_bias, &[config.hidden_size])?;

        let attention_config = AttentionConfig {
            causal: config.triangular_masking,
            softmax_scale: None,
        };
        Ok(Self {
            norm_kind: WorkspaceKind::for_layer_norm(config.precision),
            config,
            kernels,
            local_heads,
            head_dim,
            qkv,
            out,
            output_bias,
            attention: ExactAttention::new(),
            attention_config,
        })
    }

    fn split_heads(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, self.local_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()
    }

    fn merge_heads(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        let dims = tensor.dims();
        if dims.len() != 4 {
            bail!(
                "attention output expected [batch, heads, seq, head_dim] got {:?}",
                dims
            );
        }
        let (batch, seq) = (dims[0], dims[2]);
        tensor
            .permute((0, 2, 1, 3))?
            .reshape((batch, seq, self.local_heads * self.head_dim))
    }
}

impl SelfAttention for ReferenceSelfAttention {
    fn forward(&self, inputs: AttentionInputs<'_>) -> Result<AttentionOutput> {
        let hidden = inputs.hidden;
        checks::expect_batch_seq_hidden("attention.input", hidden, self.config.hidden_size)?;
        if inputs.encoder_hidden_states.is_some() || inputs.encoder_attention_mask.is_some() {
            return Err(InferenceError::invalid_argument(
                "reference attention does not support cross-attention inputs",
            ));
        }
        let dtype = hidden.dtype();
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);

        let input_norm = if self.config.pre_layer_norm {
            let normed = self.kernels.layer_norm(
                self.norm_kind,
                hidden,
                inputs.norm_weight,
                inputs.norm_bias,
                self.config.layer_norm_eps,
            )?;
            cast_tensor(&normed, dtype)?
        } else {
            hidden.clone()
        };

        let local_hidden = self.local_heads * self.head_dim;
        let qkv = self.qkv.forward(&input_norm, &policy)?;
        let query = self.split_heads(&qkv.narrow(2, 0, local_hidden)?)?;
        let key = self.split_heads(&qkv.narrow(2, local_hidden, local_hidden)?)?;
        let value = self.split_heads(&qkv.narrow(2, 2 * local_hidden, local_hidden)?)?;

        let (key, value) = match inputs.layer_past {
            Some(past) => past.append(&key, &value)?.into_parts(),
            None => (key, value),
        };

        let modifiers = ScoreModifiers {
            attention_mask: inputs.input_mask,
            head_mask: inputs.head_mask,
            alibi: inputs.alibi,
        };
        let attended = self
            .attention
            .attend(&query, &key, &value, &modifiers, &self.attention_config)?;
        let context = self.merge_heads(&attended)?;
        let output = self.out.forward(&context, &policy)?;

        Ok(AttentionOutput {
            output,
            key,
            value,
            context,
            input_norm,
        })
    }

    fn output_bias(&self) -> &Tensor {
        &self.output_bias
    }
}

/// Feed-forward block with its own residual and normalisation.
///
/// Sequential layout (`mlp_after_attn`):
/// `residual = input + attention + bias`, `x = LN(residual)`, and the result
/// is `residual + ff(x)` for pre-LN or `x + ff(x)` for post-LN.
/// Parallel layout: `input + attention + bias + ff(input_norm)`.
pub struct ReferenceMlp {
    config: Arc<InferenceConfig>,
    kernels: Arc<dyn InferenceKernels>,
    norm_kind: WorkspaceKind,
    norm_weight: Tensor,
    norm_bias: Tensor,
    ff: FeedForward,
}

impl ReferenceMlp {
    pub fn new(ctx: &BuildContext<'_>, init: &LinearInit) -> Result<Self> {
        let config = ctx.config;
        let dtype = config.parameter_dtype();
        let ff_config = FeedForwardConfig::new(
            config.hidden_size,
            config.intermediate_size() / config.mp_size,
            config.activation,
        );
        let ff = FeedForward::with_init(ff_config, init, ctx.device, dtype)?;
        let norm_weight = Tensor::ones(config.hidden_size, dtype, ctx.device)?;
        let norm_bias = Tensor::zeros(config.hidden_size, dtype, ctx.device)?;
        Self::from_parts(
            Arc::clone(config),
            Arc::clone(ctx.kernels),
            ff,
            norm_weight,
            norm_bias,
        )
    }

    pub fn from_parts(
        config: Arc<InferenceConfig>,
        kernels: Arc<dyn InferenceKernels>,
        ff: FeedForward,
        norm_weight: Tensor,
        norm_bias: Tensor,
    ) -> Result<Self> {
        if ff.config().hidden_size != config.hidden_size {
            return Err(InferenceError::invalid_argument(format!(
                "feed-forward hidden size {} does not match layer hidden size {}",
                ff.config().hidden_size,
                config.hidden_size
            )));
        }
        checks::expect_shape("mlp.norm_weight", &norm_weight, &[config.hidden_size])?;
        checks::expect_shape("mlp.norm_bias", &norm_bias, &[config.hidden_size])?;
        Ok(Self {
            norm_kind: WorkspaceKind::for_layer_norm(config.precision),
            config,
            kernels,
            norm_weight,
            norm_bias,
            ff,
        })
    }
}

impl FeedForwardBlock for ReferenceMlp {
    fn forward(
        &self,
        attention_output: &Tensor,
        input: &Tensor,
        input_norm: &Tensor,
        attention_bias: &Tensor,
    ) -> Result<Tensor> {
        let dtype = input.dtype();
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);
        let residual = cast_tensor(input, DType::F32)?
            .add(&cast_tensor(attention_output, DType::F32)?)?
            .broadcast_add(&cast_tensor(attention_bias, DType::F32)?)?;

        let output = if self.config.mlp_after_attn {
            let normed = self.kernels.layer_norm(
                self.norm_kind,
                &cast_tensor(&residual, dtype)?,
                &self.norm_weight,
                &self.norm_bias,
                self.config.layer_norm_eps,
            )?;
            let normed = cast_tensor(&normed, dtype)?;
            let ff = cast_tensor(&self.ff.forward(&normed, &policy)?, DType::F32)?;
            if self.config.pre_layer_norm {
                residual.add(&ff)?
            } else {
                cast_tensor(&normed, DType::F32)?.add(&ff)?
            }
        } else {
            let ff = self.ff.forward(input_norm, &policy)?;
            residual.add(&cast_tensor(&ff, DType::F32)?)?
        };
        Ok(cast_tensor(&output, dtype)?)
    }
}

/// Builds [`ReferenceSelfAttention`] and [`ReferenceMlp`].
#[derive(Debug, Clone)]
pub struct ReferenceComponents {
    init: LinearInit,
}

impl ReferenceComponents {
    pub fn new(init: LinearInit) -> Self {
        Self { init }
    }
}

impl Default for ReferenceComponents {
    fn default() -> Self {
        Self::new(LinearInit::XavierUniform)
    }
}

impl ComponentBuilder for ReferenceComponents {
    fn build_attention(&self, ctx: &BuildContext<'_>) -> Result<Box<dyn SelfAttention>> {
        Ok(Box::new(ReferenceSelfAttention::new(ctx, &self.init)?))
    }

    fn build_mlp(&self, ctx: &BuildContext<'_>) -> Result<Box<dyn FeedForwardBlock>> {
        log::debug!(
            "layer {}: reference MLP with {} quantization groups",
            ctx.layer_index,
            ctx.quantization.groups
        );
        Ok(Box::new(ReferenceMlp::new(ctx, &self.init)?))
    }
}
