use attention::LayerPast;
use candle_core::Tensor;

/// Result of one layer forward call.
#[derive(Debug, Clone)]
pub enum LayerOutput {
    /// Bare hidden states.
    Hidden(Tensor),
    /// Hidden states and the updated key/value pair.
    WithPresent(Tensor, LayerPast),
    /// Hidden states and the mask that arrived with the input, if any.
    Tuple(Tensor, Option<Tensor>),
}

impl LayerOutput {
    pub fn hidden(&self) -> &Tensor {
        match self {
            LayerOutput::Hidden(hidden)
            | LayerOutput::WithPresent(hidden, _)
            | LayerOutput::Tuple(hidden, _) => hidden,
        }
    }

    pub fn into_hidden(self) -> Tensor {
        match self {
            LayerOutput::Hidden(hidden)
            | LayerOutput::WithPresent(hidden, _)
            | LayerOutput::Tuple(hidden, _) => hidden,
        }
    }

    pub fn present(&self) -> Option<&LayerPast> {
        match self {
            LayerOutput::WithPresent(_, present) => Some(present),
            _ => None,
        }
    }

    /// Input for the next layer; a tuple keeps its mask attached.
    pub fn into_next_input(self) -> crate::LayerInput {
        match self {
            LayerOutput::Tuple(hidden, mask) => crate::LayerInput::WithMask(hidden, mask),
            other => crate::LayerInput::Hidden(other.into_hidden()),
        }
    }
}
