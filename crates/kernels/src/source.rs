//! Selection and lazy loading of the kernel capability set.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{
    error::{KernelError, Result},
    native::NativeKernels,
    reference::{ReferenceKernels, DEFAULT_WORKSPACE_BUDGET},
    InferenceKernels,
};

/// Environment variable naming a shared library that overrides the configured source.
pub const KERNEL_LIB_ENV: &str = "INFERENCE_KERNEL_LIB";

/// Where the kernel capability set comes from.
///
/// In TOML this is written as `kernels = "reference"` or
/// `kernels = { native = "/opt/lib/libinference_kernels.so" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelSource {
    #[default]
    Reference,
    Native(PathBuf),
}

impl KernelSource {
    /// Replaces the source with `native = value` when a non-empty value is given.
    pub fn with_override(self, value: Option<String>) -> Self {
        match value {
            Some(path) if !path.trim().is_empty() => KernelSource::Native(PathBuf::from(path)),
            _ => self,
        }
    }

    pub fn load(&self, device: &Device, budget_bytes: usize) -> Result<Arc<dyn InferenceKernels>> {
        match self {
            KernelSource::Reference => Ok(Arc::new(ReferenceKernels::new(
                device.clone(),
                budget_bytes,
            ))),
            KernelSource::Native(path) => Ok(Arc::new(NativeKernels::load(path, budget_bytes)?)),
        }
    }
}

/// Loads a kernel capability set on first use and shares it afterwards.
pub struct KernelHandle {
    source: KernelSource,
    device: Device,
    budget_bytes: usize,
    kernels: Mutex<Option<Arc<dyn InferenceKernels>>>,
}

impl KernelHandle {
    pub fn new(source: KernelSource, device: Device, budget_bytes: usize) -> Self {
        Self {
            source,
            device,
            budget_bytes,
            kernels: Mutex::new(None),
        }
    }

    /// Handle already holding `kernels`; nothing is ever loaded.
    pub fn with_kernels(kernels: Arc<dyn InferenceKernels>) -> Self {
        Self {
            source: KernelSource::Reference,
            device: Device::Cpu,
            budget_bytes: DEFAULT_WORKSPACE_BUDGET,
            kernels: Mutex::new(Some(kernels)),
        }
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    pub fn is_loaded(&self) -> bool {
        self.kernels
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Returns the capability set, loading it on the first call.
    ///
    /// A failed load leaves the handle empty so the next call retries.
    pub fn get(&self) -> Result<Arc<dyn InferenceKernels>> {
        let mut guard = self
            .kernels
            .lock()
            .map_err(|_| KernelError::Workspace("kernel handle lock poisoned".into()))?;
        if let Some(kernels) = guard.as_ref() {
            return Ok(Arc::clone(kernels));
        }
        let kernels = self.source.load(&self.device, self.budget_bytes)?;
        log::info!("inference kernels '{}' loaded", kernels.name());
        *guard = Some(Arc::clone(&kernels));
        Ok(kernels)
    }
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("source", &self.source)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
