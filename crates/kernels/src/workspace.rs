//! Workspace sizing shared by kernel implementations.
//!
//! The workspace holds per-token activations for every layer plus, unless the
//! key/value cache lives outside it, the cache itself. Its token capacity is
//! derived from the memory budget and capped by `max_out_tokens`.

use std::fmt;

use candle_core::DType;
use layers::PrecisionMode;

const MEGABYTE: usize = 1024 * 1024;
const GIGABYTE: usize = 1024 * MEGABYTE;

/// Element width selected for the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceKind {
    Fp32,
    Fp16,
}

impl WorkspaceKind {
    pub fn element_size(self) -> usize {
        match self {
            WorkspaceKind::Fp32 => 4,
            WorkspaceKind::Fp16 => 2,
        }
    }

    /// Variant used for the one-time workspace allocation: half only for `fp16`.
    pub fn for_allocation(mode: PrecisionMode) -> Self {
        match mode {
            PrecisionMode::Fp16 => WorkspaceKind::Fp16,
            PrecisionMode::Fp32 | PrecisionMode::Int8 => WorkspaceKind::Fp32,
        }
    }

    /// Variant used for layer norm: half whenever activations are reduced.
    pub fn for_layer_norm(mode: PrecisionMode) -> Self {
        if mode.uses_reduced_activations() {
            WorkspaceKind::Fp16
        } else {
            WorkspaceKind::Fp32
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            WorkspaceKind::Fp32 => DType::F32,
            WorkspaceKind::Fp16 => DType::F16,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            WorkspaceKind::Fp32 => "fp32",
            WorkspaceKind::Fp16 => "fp16",
        }
    }
}

impl fmt::Display for WorkspaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Dimensions the first layer reports when it triggers the allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRequest {
    pub hidden_size: usize,
    pub batch_size: usize,
    pub prompt_len: usize,
    /// Number of layers constructed when the allocation is requested.
    pub num_layers: usize,
    pub heads: usize,
    pub mp_size: usize,
    /// The key/value cache is kept outside the workspace.
    pub external_cache: bool,
    pub rank: usize,
    pub max_out_tokens: usize,
}

/// Sizes derived from a [`WorkspaceRequest`] and a memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspacePlan {
    pub kind: WorkspaceKind,
    /// Maximum number of tokens (prompt + generated) the workspace can hold.
    pub max_seq_len: usize,
    /// Elements in the activation/cache region.
    pub workspace_elements: usize,
    /// Bytes reserved for attention score scratch space.
    pub scratch_bytes: usize,
}

impl WorkspacePlan {
    pub fn plan(
        kind: WorkspaceKind,
        request: &WorkspaceRequest,
        budget_bytes: usize,
    ) -> Result<Self, String> {
        if request.mp_size == 0 {
            return Err("mp_size must be at least 1".into());
        }
        let elem = kind.element_size();
        let activation = 16 * request.hidden_size * request.batch_size;
        let temp = request.batch_size * request.heads * request.prompt_len * request.prompt_len
            * elem
            / request.mp_size;
        let cache =
            request.num_layers * request.batch_size * (request.hidden_size / request.mp_size) * 2;

        let reserve = if budget_bytes > GIGABYTE {
            500 * MEGABYTE
        } else {
            100 * MEGABYTE
        };
        let per_token = activation + cache;
        if per_token == 0 {
            return Err("workspace request describes an empty layer".into());
        }
        let usable = (budget_bytes.saturating_sub(reserve) / elem).saturating_sub(temp);
        let max_seq_len = (usable / per_token).min(request.max_out_tokens);

        if max_seq_len == 0 {
            return Err(format!(
                "budget of {budget_bytes} bytes leaves no room for a single token"
            ));
        }
        if request.prompt_len > max_seq_len {
            return Err(format!(
                "prompt of {} tokens exceeds workspace capacity of {max_seq_len} tokens",
                request.prompt_len
            ));
        }

        let region = if request.external_cache {
            activation
        } else {
            per_token
        };
        Ok(Self {
            kind,
            max_seq_len,
            workspace_elements: region * max_seq_len,
            scratch_bytes: temp * max_seq_len,
        })
    }

    pub fn workspace_bytes(&self) -> usize {
        self.workspace_elements * self.kind.element_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WorkspaceRequest {
        WorkspaceRequest {
            hidden_size: 64,
            batch_size: 2,
            prompt_len: 8,
            num_layers: 4,
            heads: 4,
            mp_size: 1,
            external_cache: false,
            rank: 0,
            max_out_tokens: 128,
        }
    }

    #[test]
    fn int8_allocates_full_width_but_normalises_in_half() {
        assert_eq!(
            WorkspaceKind::for_allocation(PrecisionMode::Int8),
            WorkspaceKind::Fp32
        );
        assert_eq!(
            WorkspaceKind::for_layer_norm(PrecisionMode::Int8),
            WorkspaceKind::Fp16
        );
        assert_eq!(
            WorkspaceKind::for_allocation(PrecisionMode::Fp16),
            WorkspaceKind::Fp16
        );
        assert_eq!(
            WorkspaceKind::for_layer_norm(PrecisionMode::Fp32),
            WorkspaceKind::Fp32
        );
    }

    #[test]
    fn capacity_is_capped_by_max_out_tokens() {
        let plan = WorkspacePlan::plan(WorkspaceKind::Fp16, &request(), 2 * GIGABYTE).unwrap();
        assert_eq!(plan.max_seq_len, 128);
        let activation = 16 * 64 * 2;
        let cache = 4 * 2 * 64 * 2;
        assert_eq!(plan.workspace_elements, (activation + cache) * 128);
        assert_eq!(plan.workspace_bytes(), plan.workspace_elements * 2);
    }

    #[test]
    fn external_cache_only_reserves_activations() {
        let mut req = request();
        req.external_cache = true;
        let plan = WorkspacePlan::plan(WorkspaceKind::Fp32, &req, 2 * GIGABYTE).unwrap();
        assert_eq!(plan.workspace_elements, 16 * 64 * 2 * 128);
    }

    #[test]
    fn small_budget_limits_capacity() {
        let budget = 100 * MEGABYTE + 4 * 1024 * 10;
        let mut req = request();
        req.prompt_len = 1;
        let plan = WorkspacePlan::plan(WorkspaceKind::Fp32, &req, budget).unwrap();
        // 10 Ki f32 elements, minus 32 of scratch, over (2048 + 1024) per token.
        assert_eq!(plan.max_seq_len, (10 * 1024 - 32) / (2048 + 1024));
        assert_eq!(plan.max_seq_len, 3);
    }

    #[test]
    fn empty_budget_and_long_prompts_are_errors() {
        assert!(WorkspacePlan::plan(WorkspaceKind::Fp16, &request(), 0).is_err());

        let mut req = request();
        req.prompt_len = 256;
        assert!(WorkspacePlan::plan(WorkspaceKind::Fp16, &req, 2 * GIGABYTE).is_err());

        req.mp_size = 0;
        assert!(WorkspacePlan::plan(WorkspaceKind::Fp16, &req, 2 * GIGABYTE).is_err());
    }
}
