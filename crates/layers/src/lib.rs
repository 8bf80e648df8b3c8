//! Building blocks shared by the transformer inference layer.
//!
//! Precision handling, layer normalisation, dense projections and the
//! position-wise feed-forward block, all assembled from Candle primitives.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use activations::ActivationKind;
pub use dtypes::{PrecisionMode, PrecisionPolicy};
pub use norm::layer_norm;
