//! Activation catalogue for transformer feed-forward stacks.
//!
//! Activations promote inputs to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating the non-linearity, then cast the
//! result back to the storage dtype.
//!
//! * **GELU** uses the erf formulation `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU** computes `x * sigmoid(x)` via the kernel exposed by Candle.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Non-linearity applied between the two MLP projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    #[default]
    Gelu,
    Relu,
    Silu,
}

impl ActivationKind {
    /// Applies the activation to `input` using the precision rules in `policy`.
    pub fn forward(self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self {
            ActivationKind::Identity => compute,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Silu => compute.silu()?,
        };
        policy.cast_to_storage(&activated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = ActivationKind::Gelu.forward(&input, &policy)?;

        let reference = {
            let scaled = input.affine(1.0 / SQRT_2, 0.0)?;
            let term = scaled.erf()?;
            let one = Tensor::ones_like(&term)?;
            let inner = (one + term)?;
            input.affine(0.5, 0.0)?.broadcast_mul(&inner)?
        };

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn relu_zeroes_negatives_and_keeps_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-1.0f32, 0.5, 2.0], (3,), &device)?.to_dtype(DType::F16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let output = ActivationKind::Relu.forward(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F16);
        let values = output.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert_eq!(values, vec![0.0, 0.5, 2.0]);
        Ok(())
    }

    #[test]
    fn activation_deserializes_from_lowercase() {
        let kind: ActivationKind = serde_json::from_str("\"relu\"").unwrap();
        assert_eq!(kind, ActivationKind::Relu);
        assert_eq!(ActivationKind::default(), ActivationKind::Gelu);
    }
}
