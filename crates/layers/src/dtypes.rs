//! Precision modes and dtype policy utilities used throughout the workspace.
//!
//! A layer is configured with a [`PrecisionMode`] which decides how its
//! parameters are stored and whether activations travel through the reduced
//! precision path. Reference computations inside a layer use a
//! [`PrecisionPolicy`] so that statistics are promoted to `f32` and results are
//! cast back to the storage dtype.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Numeric representation selected for a transformer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    /// Full width `f32` parameters and activations.
    Fp32,
    /// Half precision parameters and activations.
    Fp16,
    /// Int8 quantized weights; activations travel in half precision while
    /// non-quantized parameters stay in `f32`.
    Int8,
}

impl PrecisionMode {
    /// Dtype used for layer-owned parameters such as normalization vectors.
    pub fn parameter_dtype(self) -> DType {
        match self {
            PrecisionMode::Fp16 => DType::F16,
            PrecisionMode::Fp32 | PrecisionMode::Int8 => DType::F32,
        }
    }

    /// Whether activations are cast down to half precision before entering
    /// the attention and MLP blocks.
    pub fn uses_reduced_activations(self) -> bool {
        matches!(self, PrecisionMode::Fp16 | PrecisionMode::Int8)
    }

    /// Dtype activations are cast to on the reduced path.
    pub fn activation_dtype(self) -> DType {
        if self.uses_reduced_activations() {
            DType::F16
        } else {
            DType::F32
        }
    }

    /// Casts `input` down to the activation dtype when this mode requires it.
    ///
    /// Only full-width `f32` inputs are cast; tensors already in a reduced
    /// dtype are returned untouched.
    pub fn cast_input(self, input: &Tensor) -> Result<Tensor> {
        if self.uses_reduced_activations() && input.dtype() == DType::F32 {
            input.to_dtype(self.activation_dtype())
        } else {
            Ok(input.clone())
        }
    }
}

impl Default for PrecisionMode {
    fn default() -> Self {
        PrecisionMode::Fp16
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PrecisionMode::Fp32 => "fp32",
            PrecisionMode::Fp16 => "fp16",
            PrecisionMode::Int8 => "int8",
        };
        f.write_str(label)
    }
}

impl FromStr for PrecisionMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fp32" | "f32" | "float" => Ok(PrecisionMode::Fp32),
            "fp16" | "f16" | "half" => Ok(PrecisionMode::Fp16),
            "int8" | "i8" | "q_int8" => Ok(PrecisionMode::Int8),
            other => Err(format!("unknown precision mode '{other}'")),
        }
    }
}

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as layer norm statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Returns the same policy with a different storage dtype.
    pub fn with_storage(mut self, storage: DType) -> Self {
        self.storage = storage;
        self
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

/// Casts `tensor` to `dtype`, cloning the handle when no conversion is needed.
pub fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
