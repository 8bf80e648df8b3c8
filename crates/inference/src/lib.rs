//! Transformer inference layer orchestration.
//!
//! A [`TransformerInferenceLayer`] wires a self-attention module, a
//! feed-forward module, layer normalisation and a key/value cache together.
//! Numerically heavy work goes through an [`InferenceKernels`] capability set;
//! the first layer's first forward call triggers the one-time workspace
//! allocation. Layers are created by a [`LayerFactory`], which hands out layer
//! indices and owns the state they share.
//!
//! [`InferenceKernels`]: kernels::InferenceKernels

pub mod comm;
pub mod components;
pub mod config;
pub mod error;
pub mod factory;
pub mod layer;
pub mod options;
pub mod output;
pub mod reference;
pub mod workspace;

pub use comm::{Distributed, EnvDistributed, ParallelGroup, SingleProcess};
pub use components::{
    AttentionInputs, AttentionOutput, BuildContext, ComponentBuilder, FeedForwardBlock,
    QuantizationSettings, SelfAttention,
};
pub use config::InferenceConfig;
pub use error::{InferenceError, Result};
pub use factory::LayerFactory;
pub use layer::TransformerInferenceLayer;
pub use options::{ForwardOptions, LayerInput, LegacyForwardArgs};
pub use output::LayerOutput;
pub use reference::{ReferenceComponents, ReferenceMlp, ReferenceSelfAttention};
pub use workspace::LayerRegistry;
