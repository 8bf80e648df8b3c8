//! Candle implementation of the kernel capability set.

use std::sync::Mutex;

use candle_core::{Device, Tensor};
use layers::{layer_norm, PrecisionPolicy};

use crate::{
    error::{KernelError, Result},
    workspace::{WorkspaceKind, WorkspacePlan, WorkspaceRequest},
    InferenceKernels,
};

/// Default memory budget used to size the workspace.
pub const DEFAULT_WORKSPACE_BUDGET: usize = 1024 * 1024 * 1024;

#[derive(Debug)]
struct Workspace {
    plan: WorkspacePlan,
    buffer: Tensor,
}

/// Portable kernel set running on any Candle device.
///
/// The workspace is a zeroed buffer sized by [`WorkspacePlan::plan`]. It is
/// allocated on the first request; later requests keep the existing buffer.
#[derive(Debug)]
pub struct ReferenceKernels {
    device: Device,
    budget_bytes: usize,
    workspace: Mutex<Option<Workspace>>,
}

impl ReferenceKernels {
    pub fn new(device: Device, budget_bytes: usize) -> Self {
        Self {
            device,
            budget_bytes,
            workspace: Mutex::new(None),
        }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DEFAULT_WORKSPACE_BUDGET)
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Plan of the current workspace, if one has been allocated.
    pub fn workspace_plan(&self) -> Option<WorkspacePlan> {
        self.workspace
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|ws| ws.plan))
    }

    /// Number of elements held by the workspace buffer.
    pub fn workspace_len(&self) -> Option<usize> {
        self.workspace
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|ws| ws.buffer.elem_count()))
    }
}

impl Default for ReferenceKernels {
    fn default() -> Self {
        Self::cpu()
    }
}

impl InferenceKernels for ReferenceKernels {
    fn name(&self) -> &str {
        "reference"
    }

    fn allocate_workspace(
        &self,
        kind: WorkspaceKind,
        request: &WorkspaceRequest,
    ) -> Result<WorkspacePlan> {
        let mut guard = self
            .workspace
            .lock()
            .map_err(|_| KernelError::Workspace("workspace lock poisoned".into()))?;
        if let Some(existing) = guard.as_ref() {
            log::debug!(
                "workspace already allocated ({} tokens, {}), keeping it",
                existing.plan.max_seq_len,
                existing.plan.kind
            );
            return Ok(existing.plan);
        }

        let plan = WorkspacePlan::plan(kind, request, self.budget_bytes)
            .map_err(KernelError::Workspace)?;
        let buffer = Tensor::zeros(plan.workspace_elements, kind.dtype(), &self.device)?;
        log::info!(
            "allocated {kind} workspace on rank {}: {} bytes for up to {} tokens",
            request.rank,
            plan.workspace_bytes(),
            plan.max_seq_len
        );
        *guard = Some(Workspace { plan, buffer });
        Ok(plan)
    }

    fn layer_norm(
        &self,
        kind: WorkspaceKind,
        input: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        epsilon: f64,
    ) -> Result<Tensor> {
        let policy = PrecisionPolicy::from_parameter_dtype(kind.dtype());
        Ok(layer_norm(input, weight, bias, epsilon, &policy)?)
    }
}
