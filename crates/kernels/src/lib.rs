//! Kernel capability set consumed by the transformer inference layer.
//!
//! A capability set exposes the two operations the layer calls directly: the
//! one-time workspace allocation and layer normalisation. Two implementations
//! ship here: [`ReferenceKernels`], written with Candle tensor ops, and
//! [`NativeKernels`], which binds a precompiled shared library at runtime.
//! [`KernelHandle`] loads whichever one a [`KernelSource`] names, at most once.

pub mod error;
pub mod native;
pub mod reference;
pub mod source;
pub mod workspace;

use candle_core::Tensor;

pub use error::{KernelError, Result};
pub use native::NativeKernels;
pub use reference::{ReferenceKernels, DEFAULT_WORKSPACE_BUDGET};
pub use source::{KernelHandle, KernelSource, KERNEL_LIB_ENV};
pub use workspace::{WorkspaceKind, WorkspacePlan, WorkspaceRequest};

/// Operations the inference layer delegates to a kernel library.
pub trait InferenceKernels: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Reserves the process-wide workspace described by `request`.
    fn allocate_workspace(
        &self,
        kind: WorkspaceKind,
        request: &WorkspaceRequest,
    ) -> Result<WorkspacePlan>;

    /// Normalises `input` over its last axis. The output dtype follows `kind`.
    fn layer_norm(
        &self,
        kind: WorkspaceKind,
        input: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        epsilon: f64,
    ) -> Result<Tensor>;
}
