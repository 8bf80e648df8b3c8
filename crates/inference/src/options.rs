//! Arguments accepted by [`TransformerInferenceLayer::forward`].
//!
//! [`ForwardOptions`] is the single structured form. [`LegacyForwardArgs`]
//! keeps every historical argument name and resolves the aliases once, in
//! [`LegacyForwardArgs::into_options`].
//!
//! [`TransformerInferenceLayer::forward`]: crate::TransformerInferenceLayer::forward

use attention::LayerPast;
use candle_core::Tensor;

/// Named options for one forward call.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// Attention mask, either `[batch, k_len]` keep/drop or additive rank 4.
    pub input_mask: Option<Tensor>,
    pub head_mask: Option<Tensor>,
    /// Cache supplied by the caller instead of the one stored in the layer.
    pub layer_past: Option<LayerPast>,
    /// Return the updated key/value pair alongside the output.
    pub get_present: bool,
    pub encoder_hidden_states: Option<Tensor>,
    pub encoder_attention_mask: Option<Tensor>,
    pub alibi: Option<Tensor>,
    pub output_attentions: bool,
}

impl ForwardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_mask(mut self, mask: Tensor) -> Self {
        self.input_mask = Some(mask);
        self
    }

    pub fn with_head_mask(mut self, mask: Tensor) -> Self {
        self.head_mask = Some(mask);
        self
    }

    pub fn with_layer_past(mut self, past: LayerPast) -> Self {
        self.layer_past = Some(past);
        self
    }

    pub fn with_present(mut self) -> Self {
        self.get_present = true;
        self
    }

    pub fn with_alibi(mut self, alibi: Tensor) -> Self {
        self.alibi = Some(alibi);
        self
    }
}

/// Every argument name the layer has historically accepted.
#[derive(Debug, Clone, Default)]
pub struct LegacyForwardArgs {
    pub input_mask: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub head_mask: Option<Tensor>,
    pub layer_head_mask: Option<Tensor>,
    pub layer_past: Option<LayerPast>,
    pub past_key_value: Option<LayerPast>,
    pub get_key_value: bool,
    pub get_present: bool,
    pub use_cache: bool,
    pub encoder_output: Option<Tensor>,
    pub enc_dec_attn_mask: Option<Tensor>,
    pub encoder_hidden_states: Option<Tensor>,
    pub encoder_attention_mask: Option<Tensor>,
    pub alibi: Option<Tensor>,
    pub output_attentions: bool,
}

impl LegacyForwardArgs {
    /// Resolves aliases. The newer name wins when both are given.
    pub fn into_options(self) -> ForwardOptions {
        ForwardOptions {
            input_mask: self.attention_mask.or(self.input_mask),
            head_mask: self.layer_head_mask.or(self.head_mask),
            layer_past: self.layer_past.or(self.past_key_value),
            get_present: self.get_present || self.get_key_value || self.use_cache,
            encoder_hidden_states: self.encoder_hidden_states.or(self.encoder_output),
            encoder_attention_mask: self.encoder_attention_mask.or(self.enc_dec_attn_mask),
            alibi: self.alibi,
            output_attentions: self.output_attentions,
        }
    }
}

impl From<LegacyForwardArgs> for ForwardOptions {
    fn from(value: LegacyForwardArgs) -> Self {
        value.into_options()
    }
}

/// Hidden states entering a layer, optionally paired with the mask a
/// previous layer passed along.
#[derive(Debug, Clone)]
pub enum LayerInput {
    Hidden(Tensor),
    WithMask(Tensor, Option<Tensor>),
}

impl LayerInput {
    pub fn into_parts(self) -> (Tensor, Option<Tensor>) {
        match self {
            LayerInput::Hidden(hidden) => (hidden, None),
            LayerInput::WithMask(hidden, mask) => (hidden, mask),
        }
    }
}

impl From<Tensor> for LayerInput {
    fn from(value: Tensor) -> Self {
        LayerInput::Hidden(value)
    }
}

impl From<(Tensor, Tensor)> for LayerInput {
    fn from((hidden, mask): (Tensor, Tensor)) -> Self {
        LayerInput::WithMask(hidden, Some(mask))
    }
}

impl From<(Tensor, Option<Tensor>)> for LayerInput {
    fn from((hidden, mask): (Tensor, Option<Tensor>)) -> Self {
        LayerInput::WithMask(hidden, mask)
    }
}
