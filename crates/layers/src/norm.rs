//! LayerNorm and RMSNorm over the last axis of `(batch, seq, hidden)` inputs.
//!
//! Mean and variance are accumulated in [`PrecisionPolicy::reduction`]; the
//! affine step runs in the compute dtype and the result is cast to storage.

use candle_core::{DType, Device, Error, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy, scoped, NamedParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    pub epsilon: f64,
    pub kind: NormKind,
    /// Learn a per-feature scale (and shift, for LayerNorm).
    pub elementwise_affine: bool,
}

impl NormConfig {
    pub fn new(hidden_size: usize, kind: NormKind) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            kind,
            elementwise_affine: true,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Shared interface so blocks can hold either norm behind a trait object.
pub trait NormalizationLayer: Send + Sync + std::fmt::Debug {
    fn config(&self) -> &NormConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;

    fn named_parameters(&self, prefix: &str) -> NamedParameters;
}

#[derive(Debug, Clone)]
struct NormParams {
    config: NormConfig,
    weight: Option<Var>,
    bias: Option<Var>,
}

impl NormParams {
    fn new(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if config.kind == NormKind::RmsNorm && bias.is_some() {
            return Err(Error::Msg("RMSNorm does not take a bias".into()));
        }
        if config.elementwise_affine && weight.is_none() {
            return Err(Error::Msg("affine norm requires a scale parameter".into()));
        }
        if !config.elementwise_affine && (weight.is_some() || bias.is_some()) {
            return Err(Error::Msg("non-affine norm must not carry parameters".into()));
        }
        for (label, param) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            if let Some(tensor) = param {
                checks::expect_shape(label, tensor, &[config.hidden_size])?;
                checks::expect_parameter_dtype(label, tensor)?;
            }
        }
        Ok(Self {
            weight: weight.as_ref().map(Var::from_tensor).transpose()?,
            bias: bias.as_ref().map(Var::from_tensor).transpose()?,
            config,
        })
    }

    fn initialised(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let (weight, bias) = if config.elementwise_affine {
            let weight = Tensor::ones(config.hidden_size, dtype, device)?;
            let bias = match config.kind {
                NormKind::LayerNorm => Some(Tensor::zeros(config.hidden_size, dtype, device)?),
                _ => None,
            };
            (Some(weight), bias)
        } else {
            (None, None)
        };
        Self::new(config, weight, bias)
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let width = self.config.hidden_size as f64;
        let mut centered = policy.cast_for_reduction(hidden)?;
        if self.config.kind == NormKind::LayerNorm {
            let mean = (centered.sum_keepdim(D::Minus1)? / width)?;
            centered = centered.broadcast_sub(&mean)?;
        }
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / width)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?.to_dtype(policy.compute())?;

        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.as_tensor().to_dtype(policy.compute())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.as_tensor().to_dtype(policy.compute())?)?;
        }
        policy.cast_to_storage(&normalized)
    }

    fn named_parameters(&self, prefix: &str) -> NamedParameters {
        let mut params = Vec::new();
        if let Some(weight) = &self.weight {
            params.push((scoped(prefix, "weight"), weight.clone()));
        }
        if let Some(bias) = &self.bias {
            params.push((scoped(prefix, "bias"), bias.clone()));
        }
        params
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: NormParams,
}

impl LayerNorm {
    pub fn new(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if config.kind != NormKind::LayerNorm {
            return Err(Error::Msg("LayerNorm requires NormKind::LayerNorm".into()));
        }
        Ok(Self {
            inner: NormParams::new(config, weight, bias)?,
        })
    }

    /// Unit scale and zero shift.
    pub fn init(hidden_size: usize, device: &Device, dtype: DType) -> Result<Self> {
        let config = NormConfig::new(hidden_size, NormKind::LayerNorm);
        Ok(Self {
            inner: NormParams::initialised(config, device, dtype)?,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }

    fn named_parameters(&self, prefix: &str) -> NamedParameters {
        self.inner.named_parameters(prefix)
    }
}

#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormParams,
}

impl RmsNorm {
    pub fn new(config: NormConfig, weight: Option<Tensor>) -> Result<Self> {
        if config.kind != NormKind::RmsNorm {
            return Err(Error::Msg("RmsNorm requires NormKind::RmsNorm".into()));
        }
        Ok(Self {
            inner: NormParams::new(config, weight, None)?,
        })
    }

    pub fn init(hidden_size: usize, device: &Device, dtype: DType) -> Result<Self> {
        let config = NormConfig::new(hidden_size, NormKind::RmsNorm);
        Ok(Self {
            inner: NormParams::initialised(config, device, dtype)?,
        })
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }

    fn named_parameters(&self, prefix: &str) -> NamedParameters {
        self.inner.named_parameters(prefix)
    }
}

/// Builds a freshly initialised norm of the requested kind.
pub fn build_norm(
    kind: NormKind,
    hidden_size: usize,
    epsilon: f64,
    device: &Device,
    dtype: DType,
) -> Result<Box<dyn NormalizationLayer>> {
    let config = NormConfig::new(hidden_size, kind).with_epsilon(epsilon);
    let inner = NormParams::initialised(config, device, dtype)?;
    Ok(match kind {
        NormKind::RmsNorm => Box::new(RmsNorm { inner }),
        _ => Box::new(LayerNorm { inner }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_candle_reference() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 16;
        let input = Tensor::randn(0f32, 1.0, (2, 3, hidden), &device)?;
        let weight = Tensor::randn(1f32, 0.1, hidden, &device)?;
        let bias = Tensor::randn(0f32, 0.1, hidden, &device)?;

        let config = NormConfig::new(hidden, NormKind::LayerNorm);
        let norm = LayerNorm::new(config, Some(weight.clone()), Some(bias.clone()))?;
        let ours = norm.forward(&input, &PrecisionPolicy::from_parameter_dtype(DType::F32))?;
        let reference = candle_nn::ops::layer_norm(&input, &weight, &bias, 1e-5)?;
        assert!(max_diff(&ours, &reference)? < 1e-4);
        Ok(())
    }

    #[test]
    fn rms_norm_matches_candle_reference() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        let weight = Tensor::randn(1f32, 0.1, 8, &device)?;

        let norm = RmsNorm::new(NormConfig::new(8, NormKind::RmsNorm), Some(weight.clone()))?;
        let ours = norm.forward(&input, &PrecisionPolicy::from_parameter_dtype(DType::F32))?;
        let reference = candle_nn::ops::rms_norm(&input, &weight, 1e-5)?;
        assert!(max_diff(&ours, &reference)? < 1e-4);
        Ok(())
    }

    #[test]
    fn half_precision_output_keeps_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let norm = build_norm(NormKind::LayerNorm, 8, 1e-5, &device, DType::BF16)?;
        let input = Tensor::randn(0f32, 1.0, (1, 2, 8), &device)?.to_dtype(DType::BF16)?;
        let output = norm.forward(&input, &PrecisionPolicy::from_parameter_dtype(DType::BF16))?;
        assert_eq!(output.dtype(), DType::BF16);
        assert_eq!(output.dims(), &[1, 2, 8]);
        Ok(())
    }

    #[test]
    fn rejects_invalid_parameters() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::ones(4, DType::F32, &device)?;
        let bias = Tensor::zeros(4, DType::F32, &device)?;
        let mut config = NormConfig::new(4, NormKind::RmsNorm);
        assert!(NormParams::new(config.clone(), Some(weight.clone()), Some(bias)).is_err());
        assert!(RmsNorm::new(config.clone(), None).is_err());
        config.elementwise_affine = false;
        assert!(RmsNorm::new(config, Some(weight)).is_err());
        Ok(())
    }

    #[test]
    fn parameter_names_depend_on_kind() -> Result<()> {
        let device = Device::Cpu;
        let ln = build_norm(NormKind::LayerNorm, 4, 1e-5, &device, DType::F32)?;
        let rms = build_norm(NormKind::RmsNorm, 4, 1e-5, &device, DType::F32)?;
        assert_eq!(ln.named_parameters("final_norm").len(), 2);
        let names: Vec<_> = rms
            .named_parameters("final_norm")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, ["final_norm.weight"]);
        Ok(())
    }
}
