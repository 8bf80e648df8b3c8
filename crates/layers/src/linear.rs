//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` or `(rows, in_dim)`
//! and return tensors with the same leading dims and `out_dim` features.
//! Multi-projection variants pack the output as
//! `(batch, seq, num_projections * output_dim)` so that callers can split the
//! fused query/key/value projection themselves. Weights and activations are
//! cast to [`PrecisionPolicy::compute`] for the matmul and the result is cast
//! back with [`PrecisionPolicy::cast_to_storage`].

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Every weight set to the same value; handy for deterministic tests.
    Constant(f64),
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::Constant(value) => Tensor::full(*value as f32, shape, device)?,
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            weight_f32.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias and a mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is laid out `(total_output_dim, input_dim)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.total_output_dim(), config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_output_dim(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, &checks::FLOAT_DTYPES)?;
        checks::expect_contiguous("linear.weight", weight)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::expect_dtype_in("linear.bias", tensor, &checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    /// Applies the projection, promoting to the compute dtype for the matmul.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;
        let out_dim = self.config.total_output_dim();

        let mut output = match input.dims() {
            [batch, seq, hidden_dim] if *hidden_dim == self.config.input_dim => {
                let (batch, seq) = (*batch, *seq);
                input
                    .reshape((batch * seq, self.config.input_dim))?
                    .matmul(&weight_t)?
                    .reshape((batch, seq, out_dim))?
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, {}] or [T, {}], got {:?}",
                    self.config.input_dim, self.config.input_dim, dims
                )))
            }
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }
}
