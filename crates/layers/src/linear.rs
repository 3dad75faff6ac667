//! Dense projections used by the ALR and decoder blocks.
//!
//! Linear layers accept `(batch, seq, in_dim)` or `(rows, in_dim)` inputs and
//! return the same leading layout with `out_dim` features. Fused variants pack
//! `fused_projections` outputs side by side (`q|k|v` for attention, `up|gate`
//! for gated MLPs) so callers can split them with `narrow`. Matmuls run in
//! [`PrecisionPolicy::compute`] and results are cast back to storage.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy, scoped, NamedParameters};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }

    pub fn fused(mut self, projections: usize) -> Self {
        self.fused_projections = projections;
        self
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Weight initialisation policies for transformer projections.
#[derive(Debug, Clone)]
pub enum LinearInit {
    XavierUniform,
    XavierNormal,
    KaimingUniform { negative_slope: f64 },
    KaimingNormal { negative_slope: f64 },
    /// Plain normal initialisation, e.g. `std = 0.02` for GPT-style heads.
    Normal { std: f64 },
    /// Scales another policy to support deep network stabilisation.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample_f32(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::rand(-bound, bound, shape, device)
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::randn(0f32, std, shape, device)
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64.sqrt() * gain / fan_in.sqrt()) as f32;
                Tensor::rand(-bound, bound, shape, device)
            }
            LinearInit::KaimingNormal { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                Tensor::randn(0f32, (gain / fan_in.sqrt()) as f32, shape, device)
            }
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device),
            LinearInit::Scaled { base, scale } => base.sample_f32(shape, device)?.affine(*scale, 0.0),
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let weight = self.sample_f32(shape, device)?;
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            weight.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        validate_weight(&config, &weight)?;
        validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias: bias.as_ref().map(Var::from_tensor).transpose()?,
            config,
        })
    }

    /// Builds a linear layer with randomly initialised weights and a zero bias.
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
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Overwrites the weight in place; gradients keep tracking the same variable.
    pub fn set_weight(&self, value: &Tensor) -> Result<()> {
        validate_weight(&self.config, value)?;
        self.weight.set(&value.to_dtype(self.weight.dtype())?)
    }

    pub fn named_parameters(&self, prefix: &str) -> NamedParameters {
        let mut params = vec![(scoped(prefix, "weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((scoped(prefix, "bias"), bias.clone()));
        }
        params
    }

    /// Applies `x W^T + b`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(self.weight.as_tensor())?.t()?;
        let out_dim = self.config.total_output_dim();

        let mut output = match input.dims() {
            [batch, seq, in_dim] if *in_dim == self.config.input_dim => {
                let (batch, seq) = (*batch, *seq);
                input
                    .reshape((batch * seq, self.config.input_dim))?
                    .matmul(&weight_t)?
                    .reshape((batch, seq, out_dim))?
            }
            [_, in_dim] if *in_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, {0}] or [T, {0}], got {dims:?}",
                    self.config.input_dim
                )))
            }
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}

fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
    checks::expect_rank("linear.weight", weight, 2)?;
    checks::expect_shape(
        "linear.weight",
        weight,
        &[config.total_output_dim(), config.input_dim],
    )?;
    checks::expect_parameter_dtype("linear.weight", weight)
}

fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
    match (config.bias, bias) {
        (true, Some(tensor)) => {
            checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
            checks::expect_parameter_dtype("linear.bias", tensor)
        }
        (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
        (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
        (false, None) => Ok(()),
    }
}
