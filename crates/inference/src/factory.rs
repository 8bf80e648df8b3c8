//! Construction of transformer inference layers.

use std::sync::Arc;

use candle_core::Device;
use kernels::{InferenceKernels, KernelHandle, WorkspacePlan};

use crate::{
    comm::{Distributed, ParallelGroup, SingleProcess},
    components::{BuildContext, ComponentBuilder, QuantizationSettings},
    config::InferenceConfig,
    error::Result,
    layer::{LayerParts, TransformerInferenceLayer},
    reference::ReferenceComponents,
    workspace::LayerRegistry,
};

/// Builds layers that share one kernel set, one index sequence and one
/// workspace.
///
/// Indices start at zero and grow by one per [`build`](Self::build) call.
/// Separate factories never share state.
pub struct LayerFactory {
    kernels: KernelHandle,
    device: Device,
    distributed: Arc<dyn Distributed>,
    builder: Arc<dyn ComponentBuilder>,
    registry: Arc<LayerRegistry>,
}

impl LayerFactory {
    pub fn new(kernels: KernelHandle) -> Self {
        Self {
            kernels,
            device: Device::Cpu,
            distributed: Arc::new(SingleProcess),
            builder: Arc::new(ReferenceComponents::default()),
            registry: Arc::new(LayerRegistry::new()),
        }
    }

    /// Factory whose kernels come from `config.kernels`, loaded on the first build.
    pub fn from_config(config: &InferenceConfig, device: Device) -> Self {
        let kernels = KernelHandle::new(
            config.kernels.clone(),
            device.clone(),
            config.workspace_budget_bytes,
        );
        Self::new(kernels).with_device(device)
    }

    /// Factory using an already constructed kernel set.
    pub fn with_kernels(kernels: Arc<dyn InferenceKernels>) -> Self {
        Self::new(KernelHandle::with_kernels(kernels))
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_distributed(mut self, distributed: Arc<dyn Distributed>) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn with_builder(mut self, builder: Arc<dyn ComponentBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn kernels(&self) -> &KernelHandle {
        &self.kernels
    }

    pub fn layers_built(&self) -> usize {
        self.registry.layers_built()
    }

    pub fn workspace_plan(&self) -> Option<WorkspacePlan> {
        self.registry.workspace_plan()
    }

    /// Builds the next layer.
    ///
    /// Loads the kernel set if this is the first build; a load failure is
    /// returned before an index is claimed.
    pub fn build(
        &self,
        config: Arc<InferenceConfig>,
        group: ParallelGroup,
        quantization: QuantizationSettings,
    ) -> Result<TransformerInferenceLayer> {
        config.validate()?;
        let kernels = self.kernels.get()?;
        let index = self.registry.next_index();
        let rank = self.distributed.effective_rank();

        if index == 0 && rank == 0 {
            let rendered =
                serde_json::to_string(config.as_ref()).unwrap_or_else(|_| format!("{config:?}"));
            log::info!("transformer inference layer config: {rendered}");
        }

        let ctx = BuildContext {
            config: &config,
            group: &group,
            quantization: &quantization,
            kernels: &kernels,
            device: &self.device,
            layer_index: index,
        };
        let attention = self.builder.build_attention(&ctx)?;
        let mlp_quantization = quantization.for_mlp();
        let mlp = self.builder.build_mlp(&BuildContext {
            quantization: &mlp_quantization,
            ..ctx
        })?;

        TransformerInferenceLayer::new(LayerParts {
            index,
            config,
            kernels,
            attention,
            mlp,
            registry: Arc::clone(&self.registry),
            device: self.device.clone(),
            rank,
        })
    }
}

impl std::fmt::Debug for LayerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerFactory")
            .field("kernels", &self.kernels)
            .field("distributed", &self.distributed)
            .field("layers_built", &self.layers_built())
            .finish()
    }
}
