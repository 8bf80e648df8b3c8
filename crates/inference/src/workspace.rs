//! State shared by every layer a [`LayerFactory`](crate::LayerFactory) builds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use kernels::{KernelError, WorkspacePlan};

use crate::error::Result;

/// Layer counter and the one-time workspace allocation.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    next_index: AtomicUsize,
    workspace: Mutex<Option<WorkspacePlan>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the next layer index.
    pub(crate) fn next_index(&self) -> usize {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    pub fn layers_built(&self) -> usize {
        self.next_index.load(Ordering::SeqCst)
    }

    pub fn workspace_plan(&self) -> Option<WorkspacePlan> {
        self.workspace.lock().ok().and_then(|guard| *guard)
    }

    /// Runs `allocate` unless a workspace already exists.
    ///
    /// A failed allocation leaves the slot empty.
    pub(crate) fn ensure_workspace<F>(&self, allocate: F) -> Result<WorkspacePlan>
    where
        F: FnOnce() -> Result<WorkspacePlan>,
    {
        let mut guard = self
            .workspace
            .lock()
            .map_err(|_| KernelError::Workspace("workspace lock poisoned".into()))?;
        if let Some(plan) = *guard {
            return Ok(plan);
        }
        let plan = allocate()?;
        *guard = Some(plan);
        Ok(plan)
    }
}
