//! Kernel set backed by a precompiled shared library.
//!
//! The library must export the following C symbols:
//!
//! ```c
//! int allocate_workspace_fp32(uint32_t hidden, uint32_t batch, uint32_t prompt,
//!                             uint32_t layers, uint32_t heads, uint32_t mp_size,
//!                             bool external_cache, uint32_t rank,
//!                             uint32_t max_out_tokens);
//! int allocate_workspace_fp16(/* same arguments */);
//! int layer_norm_fp32(float *out, const float *input, const float *gamma,
//!                     const float *beta, uint64_t rows, uint64_t cols, float eps);
//! int layer_norm_fp16(uint16_t *out, const uint16_t *input, const uint16_t *gamma,
//!                     const uint16_t *beta, uint64_t rows, uint64_t cols, float eps);
//! ```
//!
//! A non-zero return value is reported as [`KernelError::Native`].

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use half::f16;
use libloading::Library;

use crate::{
    error::{KernelError, Result},
    workspace::{WorkspaceKind, WorkspacePlan, WorkspaceRequest},
    InferenceKernels,
};

type AllocateWorkspaceFn =
    unsafe extern "C" fn(u32, u32, u32, u32, u32, u32, bool, u32, u32) -> i32;
type LayerNormF32Fn =
    unsafe extern "C" fn(*mut f32, *const f32, *const f32, *const f32, u64, u64, f32) -> i32;
type LayerNormF16Fn =
    unsafe extern "C" fn(*mut f16, *const f16, *const f16, *const f16, u64, u64, f32) -> i32;

const ALLOCATE_FP32: &[u8] = b"allocate_workspace_fp32\0";
const ALLOCATE_FP16: &[u8] = b"allocate_workspace_fp16\0";
const LAYER_NORM_FP32: &[u8] = b"layer_norm_fp32\0";
const LAYER_NORM_FP16: &[u8] = b"layer_norm_fp16\0";

struct Symbols {
    allocate_fp32: AllocateWorkspaceFn,
    allocate_fp16: AllocateWorkspaceFn,
    layer_norm_fp32: LayerNormF32Fn,
    layer_norm_fp16: LayerNormF16Fn,
}

/// Kernel set resolved from a shared library at runtime.
pub struct NativeKernels {
    path: PathBuf,
    budget_bytes: usize,
    symbols: Symbols,
    // Function pointers in `symbols` stay valid only while the library is loaded.
    _lib: Library,
}

impl NativeKernels {
    /// Opens `path` and resolves every required symbol.
    pub fn load(path: impl AsRef<Path>, budget_bytes: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // SAFETY: loading a library runs its initialisers; the path is chosen
        // by the operator through configuration.
        let lib = unsafe { Library::new(&path) }.map_err(|err| KernelError::Load {
            path: path.clone(),
            message: err.to_string(),
        })?;

        let symbols = Symbols {
            allocate_fp32: load_symbol(&lib, &path, ALLOCATE_FP32)?,
            allocate_fp16: load_symbol(&lib, &path, ALLOCATE_FP16)?,
            layer_norm_fp32: load_symbol(&lib, &path, LAYER_NORM_FP32)?,
            layer_norm_fp16: load_symbol(&lib, &path, LAYER_NORM_FP16)?,
        };
        log::info!("loaded native inference kernels from {}", path.display());

        Ok(Self {
            path,
            budget_bytes,
            symbols,
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_symbol<T: Copy>(lib: &Library, path: &Path, name: &'static [u8]) -> Result<T> {
    // SAFETY: the requested type matches the C signature documented above.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|_| KernelError::MissingSymbol {
        path: path.to_path_buf(),
        symbol: symbol_name(name).to_string(),
    })?;
    Ok(*sym)
}

fn symbol_name(name: &'static [u8]) -> &'static str {
    let trimmed = name.strip_suffix(b"\0").unwrap_or(name);
    std::str::from_utf8(trimmed).unwrap_or("<invalid symbol>")
}

fn check_status(code: i32, symbol: &'static [u8]) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(KernelError::Native {
            symbol: symbol_name(symbol),
            code,
        })
    }
}

fn as_u32(field: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| KernelError::Workspace(format!("{field}={value} does not fit in u32")))
}

/// Splits `input` into `(rows, cols)` for a row-wise kernel.
fn rows_and_cols(input: &Tensor) -> Result<(usize, usize)> {
    match input.dims().split_last() {
        Some((&cols, leading)) if cols > 0 => Ok((leading.iter().product(), cols)),
        _ => Err(KernelError::Candle(candle_core::Error::Msg(format!(
            "layer norm expects a non-empty last axis, got {:?}",
            input.dims()
        )))),
    }
}

fn host_vec<T: candle_core::WithDType>(tensor: &Tensor, dtype: DType) -> Result<Vec<T>> {
    Ok(tensor.to_dtype(dtype)?.flatten_all()?.to_vec1::<T>()?)
}

impl InferenceKernels for NativeKernels {
    fn name(&self) -> &str {
        "native"
    }

    fn allocate_workspace(
        &self,
        kind: WorkspaceKind,
        request: &WorkspaceRequest,
    ) -> Result<WorkspacePlan> {
        let plan = WorkspacePlan::plan(kind, request, self.budget_bytes)
            .map_err(KernelError::Workspace)?;
        let (func, symbol) = match kind {
            WorkspaceKind::Fp32 => (self.symbols.allocate_fp32, ALLOCATE_FP32),
            WorkspaceKind::Fp16 => (self.symbols.allocate_fp16, ALLOCATE_FP16),
        };
        // SAFETY: scalar arguments only; the library owns the allocation.
        let code = unsafe {
            func(
                as_u32("hidden_size", request.hidden_size)?,
                as_u32("batch_size", request.batch_size)?,
                as_u32("prompt_len", request.prompt_len)?,
                as_u32("num_layers", request.num_layers)?,
                as_u32("heads", request.heads)?,
                as_u32("mp_size", request.mp_size)?,
                request.external_cache,
                as_u32("rank", request.rank)?,
                as_u32("max_out_tokens", request.max_out_tokens)?,
            )
        };
        check_status(code, symbol)?;
        log::info!(
            "native {kind} workspace allocated on rank {} for up to {} tokens",
            request.rank,
            plan.max_seq_len
        );
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
        let (rows, cols) = rows_and_cols(input)?;
        if weight.elem_count() != cols || bias.elem_count() != cols {
            return Err(KernelError::Candle(candle_core::Error::Msg(format!(
                "layer norm parameters must have {cols} elements, got {} and {}",
                weight.elem_count(),
                bias.elem_count()
            ))));
        }
        let dims = input.dims().to_vec();
        let device: &Device = input.device();

        match kind {
            WorkspaceKind::Fp32 => {
                let x = host_vec::<f32>(input, DType::F32)?;
                let gamma = host_vec::<f32>(weight, DType::F32)?;
                let beta = host_vec::<f32>(bias, DType::F32)?;
                let mut out = vec![0f32; x.len()];
                // SAFETY: every buffer holds rows * cols (or cols) elements.
                let code = unsafe {
                    (self.symbols.layer_norm_fp32)(
                        out.as_mut_ptr(),
                        x.as_ptr(),
                        gamma.as_ptr(),
                        beta.as_ptr(),
                        rows as u64,
                        cols as u64,
                        epsilon as f32,
                    )
                };
                check_status(code, LAYER_NORM_FP32)?;
                Ok(Tensor::from_vec(out, dims, device)?)
            }
            WorkspaceKind::Fp16 => {
                let x = host_vec::<f16>(input, DType::F16)?;
                let gamma = host_vec::<f16>(weight, DType::F16)?;
                let beta = host_vec::<f16>(bias, DType::F16)?;
                let mut out = vec![f16::ZERO; x.len()];
                // SAFETY: as above; `f16` is a transparent `u16`.
                let code = unsafe {
                    (self.symbols.layer_norm_fp16)(
                        out.as_mut_ptr(),
                        x.as_ptr(),
                        gamma.as_ptr(),
                        beta.as_ptr(),
                        rows as u64,
                        cols as u64,
                        epsilon as f32,
                    )
                };
                check_status(code, LAYER_NORM_FP16)?;
                Ok(Tensor::from_vec(out, dims, device)?)
            }
        }
    }
}
