use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

/// Dynamic loss scaling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    fn sanitized(mut self) -> Self {
        self.growth_factor = self.growth_factor.max(1.0);
        if !(0.0..1.0).contains(&self.backoff_factor) || self.backoff_factor == 0.0 {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if self.min_scale <= 0.0 {
            self.min_scale = 1.0;
        }
        self.max_scale = self.max_scale.max(self.min_scale);
        self.initial_scale = self.initial_scale.clamp(self.min_scale, self.max_scale);
        self
    }
}

/// Serialisable scaler position, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: usize,
    pub skipped_steps: usize,
}

/// Multiplies the loss before backward so small reduced-precision gradients
/// survive, then divides the gradients back and backs off on overflow.
/// A no-op for f32 runs.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    enabled: bool,
    loss_scale: f32,
    stable_steps: usize,
    skipped_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        let config = config.sanitized();
        let enabled = precision != Precision::Fp32;
        Self {
            enabled,
            loss_scale: if enabled { config.initial_scale } else { 1.0 },
            stable_steps: 0,
            skipped_steps: 0,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    /// Optimizer steps dropped because of non-finite gradients.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.loss_scale as f64, 0.0)?)
    }

    pub fn unscale(&self, grad: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.enabled {
            return Ok(grad.clone());
        }
        Ok(grad.affine(1.0 / self.loss_scale as f64, 0.0)?)
    }

    /// Unscales the gradients of `params` in place. Returns `true` when any of
    /// them holds a NaN or infinity.
    pub fn unscale_gradients(
        &self,
        grads: &mut GradStore,
        params: &[Var],
    ) -> Result<bool, TrainingError> {
        let mut found_inf = false;
        for param in params {
            let Some(grad) = grads.remove(param.as_tensor()) else {
                continue;
            };
            let grad = self.unscale(&grad)?;
            if !found_inf && contains_non_finite(&grad)? {
                found_inf = true;
            }
            grads.insert(param.as_tensor(), grad);
        }
        Ok(found_inf)
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.skipped_steps += 1;
        }
        if !self.enabled {
            return;
        }
        if found_inf {
            self.loss_scale = (self.loss_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
            log::warn!("non-finite gradients; loss scale reduced to {}", self.loss_scale);
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.config.growth_interval {
                self.loss_scale = (self.loss_scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_steps = 0;
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            enabled: self.enabled,
            loss_scale: self.loss_scale,
            stable_steps: self.stable_steps,
            skipped_steps: self.skipped_steps,
        }
    }

    pub fn load_state(&mut self, state: GradientScalerState) -> Result<(), TrainingError> {
        if state.enabled != self.enabled {
            return Err(TrainingError::runtime(format!(
                "checkpoint loss scaling enabled={} but this run uses enabled={}",
                state.enabled, self.enabled
            )));
        }
        if !(state.loss_scale.is_finite() && state.loss_scale > 0.0) {
            return Err(TrainingError::runtime(format!(
                "checkpoint loss scale {} is invalid",
                state.loss_scale
            )));
        }
        self.loss_scale = state.loss_scale;
        self.stable_steps = state.stable_steps;
        self.skipped_steps = state.skipped_steps;
        Ok(())
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)?
        .abs()?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok(!sum.is_finite())
}
