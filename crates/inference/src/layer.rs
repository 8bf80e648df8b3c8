//! One transformer layer at inference time.

use std::sync::Arc;

use attention::LayerPast;
use candle_core::{Device, Tensor};
use kernels::{InferenceKernels, WorkspaceKind, WorkspacePlan, WorkspaceRequest};
use layers::{checks, dtypes::cast_tensor};

use crate::{
    components::{AttentionInputs, FeedForwardBlock, SelfAttention},
    config::InferenceConfig,
    error::{InferenceError, Result},
    options::{ForwardOptions, LayerInput, LegacyForwardArgs},
    output::LayerOutput,
    workspace::LayerRegistry,
};

/// Attention, MLP, layer norm and key/value cache of one model layer.
///
/// Built by [`LayerFactory::build`](crate::LayerFactory::build).
pub struct TransformerInferenceLayer {
    index: usize,
    config: Arc<InferenceConfig>,
    kernels: Arc<dyn InferenceKernels>,
    attention: Box<dyn SelfAttention>,
    mlp: Box<dyn FeedForwardBlock>,
    norm_weight: Tensor,
    norm_bias: Tensor,
    layer_past: Option<LayerPast>,
    registry: Arc<LayerRegistry>,
    device: Device,
    rank: usize,
}

pub(crate) struct LayerParts {
    pub index: usize,
    pub config: Arc<InferenceConfig>,
    pub kernels: Arc<dyn InferenceKernels>,
    pub attention: Box<dyn SelfAttention>,
    pub mlp: Box<dyn FeedForwardBlock>,
    pub registry: Arc<LayerRegistry>,
    pub device: Device,
    pub rank: usize,
}

impl TransformerInferenceLayer {
    pub(crate) fn new(parts: LayerParts) -> Result<Self> {
        let LayerParts {
            index,
            config,
            kernels,
            attention,
            mlp,
            registry,
            device,
            rank,
        } = parts;
        let dtype = config.parameter_dtype();
        let norm_weight = Tensor::ones(config.hidden_size, dtype, &device)?;
        let norm_bias = Tensor::zeros(config.hidden_size, dtype, &device)?;
        Ok(Self {
            index,
            config,
            kernels,
            attention,
            mlp,
            norm_weight,
            norm_bias,
            layer_past: None,
            registry,
            device,
            rank,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &Arc<InferenceConfig> {
        &self.config
    }

    pub fn norm_weight(&self) -> &Tensor {
        &self.norm_weight
    }

    pub fn norm_bias(&self) -> &Tensor {
        &self.norm_bias
    }

    /// Key/value pair kept from the last forward call.
    pub fn layer_past(&self) -> Option<&LayerPast> {
        self.layer_past.as_ref()
    }

    pub fn reset_cache(&mut self) {
        self.layer_past = None;
    }

    pub fn workspace_plan(&self) -> Option<WorkspacePlan> {
        self.registry.workspace_plan()
    }

    /// Replaces the norm parameters, e.g. with checkpoint values.
    ///
    /// Both tensors must hold `hidden_size` elements; they are converted to
    /// the layer's parameter dtype and device.
    pub fn set_norm_parameters(&mut self, weight: &Tensor, bias: &Tensor) -> Result<()> {
        let hidden = self.config.hidden_size;
        checks::expect_shape("layer.norm_weight", weight, &[hidden])?;
        checks::expect_shape("layer.norm_bias", bias, &[hidden])?;
        let dtype = self.config.parameter_dtype();
        self.norm_weight = weight.to_device(&self.device)?.to_dtype(dtype)?;
        self.norm_bias = bias.to_device(&self.device)?.to_dtype(dtype)?;
        Ok(())
    }

    /// Forward call using the historical argument names.
    pub fn forward_legacy(
        &mut self,
        input: impl Into<LayerInput>,
        args: LegacyForwardArgs,
    ) -> Result<LayerOutput> {
        self.forward(input, args.into_options())
    }

    pub fn forward(
        &mut self,
        input: impl Into<LayerInput>,
        options: ForwardOptions,
    ) -> Result<LayerOutput> {
        let (hidden, attn_mask) = input.into().into_parts();
        let (batch, seq_len, _) = match hidden.dims() {
            [batch, seq, width]
                if *width == self.config.hidden_size && *batch > 0 && *seq > 0 =>
            {
                (*batch, *seq, *width)
            }
            dims => {
                return Err(InferenceError::invalid_argument(format!(
                    "layer {} expects a non-empty input shaped [batch, seq, {}], got {:?}",
                    self.index, self.config.hidden_size, dims
                )))
            }
        };

        if self.index == 0 {
            self.ensure_workspace(batch, seq_len)?;
        }

        let ForwardOptions {
            input_mask,
            head_mask,
            layer_past,
            get_present,
            encoder_hidden_states,
            encoder_attention_mask,
            alibi,
            output_attentions,
        } = options;

        // A prompt starts a new sequence.
        if seq_len > 1 {
            self.layer_past = None;
        }
        let explicit_past = layer_past.is_some();

        let input_dtype = hidden.dtype();
        let hidden = self.config.precision.cast_input(&hidden.detach())?;

        let attended = self.attention.forward(AttentionInputs {
            hidden: &hidden,
            input_mask: input_mask.as_ref(),
            head_mask: head_mask.as_ref(),
            layer_past: layer_past.as_ref().or(self.layer_past.as_ref()),
            get_present,
            encoder_hidden_states: encoder_hidden_states.as_ref(),
            encoder_attention_mask: encoder_attention_mask.as_ref(),
            output_attentions,
            norm_weight: &self.norm_weight,
            norm_bias: &self.norm_bias,
            alibi: alibi.as_ref(),
        })?;

        let presents = LayerPast::new(attended.key, attended.value);
        if !explicit_past {
            self.layer_past = Some(presents.clone());
        }

        let mut output = self.mlp.forward(
            &attended.output,
            &hidden,
            &attended.input_norm,
            self.attention.output_bias(),
        )?;

        if !self.config.pre_layer_norm {
            output = self.kernels.layer_norm(
                WorkspaceKind::for_layer_norm(self.config.precision),
                &output,
                &self.norm_weight,
                &self.norm_bias,
                self.config.layer_norm_eps,
            )?;
        }
        let output = cast_tensor(&output, input_dtype)?;

        Ok(if get_present {
            LayerOutput::WithPresent(output, presents)
        } else if self.config.return_tuple {
            LayerOutput::Tuple(output, attn_mask)
        } else {
            LayerOutput::Hidden(output)
        })
    }

    fn ensure_workspace(&self, batch_size: usize, prompt_len: usize) -> Result<WorkspacePlan> {
        self.registry.ensure_workspace(|| {
            let request = WorkspaceRequest {
                hidden_size: self.config.hidden_size,
                batch_size,
                prompt_len,
                num_layers: self.registry.layers_built(),
                heads: self.config.heads,
                mp_size: self.config.mp_size,
                external_cache: self.config.external_cache,
                rank: self.rank,
                max_out_tokens: self.config.max_out_tokens,
            };
            let kind = WorkspaceKind::for_allocation(self.config.precision);
            log::debug!(
                "layer {} requesting {kind} workspace: {:?}",
                self.index,
                request
            );
            Ok(self.kernels.allocate_workspace(kind, &request)?)
        })
    }
}

impl std::fmt::Debug for TransformerInferenceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerInferenceLayer")
            .field("index", &self.index)
            .field("hidden_size", &self.config.hidden_size)
            .field("precision", &self.config.precision)
            .field("cached_tokens", &self.layer_past.as_ref().map(LayerPast::seq_len))
            .finish()
    }
}
