//! AdamW over named `Var`s, with optional f32 master weights and global-norm
//! clipping.

use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainerOptimizerOptions {
    pub use_master_weights: bool,
    pub clip_global_norm: Option<f64>,
    /// Name fragments excluded from weight decay.
    pub weight_decay_exclude: Vec<String>,
}

impl From<&config::OptimizerConfig> for TrainerOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            use_master_weights: value.use_master_weights,
            clip_global_norm: value.max_grad_norm,
            weight_decay_exclude: value.weight_decay_exclude.clone(),
        }
    }
}

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
    pub updated_parameters: usize,
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Var,
    second_moment: Var,
    apply_weight_decay: bool,
}

impl ParameterSlot {
    fn write_back(&self, value: &Tensor) -> Result<(), TrainingError> {
        if let Some(master) = &self.master {
            master.set(value)?;
        }
        if self.dtype == DType::F32 {
            self.param.set(value)?;
        } else {
            self.param.set(&value.to_dtype(self.dtype)?)?;
        }
        Ok(())
    }
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let dtype = var.dtype();
            if !dtype.is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{name}'"
                )));
            }
            // Moments live in `Var`s so `set` replaces their storage without
            // chaining autograd history across steps.
            let first_moment = Var::zeros(var.dims(), DType::F32, var.device())?;
            let second_moment = Var::zeros(var.dims(), DType::F32, var.device())?;
            let master = if options.use_master_weights && dtype != DType::F32 {
                Some(Var::from_tensor(&var.as_tensor().to_dtype(DType::F32)?)?)
            } else {
                None
            };
            let apply_weight_decay = !options
                .weight_decay_exclude
                .iter()
                .any(|fragment| !fragment.is_empty() && name.contains(fragment.as_str()));

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        let decayed = params.iter().filter(|slot| slot.apply_weight_decay).count();
        log::debug!(
            "optimizer tracks {} parameter tensor(s), {decayed} with weight decay",
            params.len()
        );

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Completed update steps.
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Consumes the gradients of tracked parameters from `grads` and applies
    /// one AdamW update. Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<StepReport, TrainingError> {
        let mut processed = Vec::with_capacity(self.params.len());
        let mut total_sq = 0.0f64;
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            total_sq += grad.sqr()?.sum_all()?.to_vec0::<f32>()? as f64;
            processed.push((index, grad));
        }

        let grad_norm = total_sq.sqrt();
        if processed.is_empty() {
            return Ok(StepReport {
                grad_norm,
                clipped: false,
                updated_parameters: 0,
            });
        }

        let mut clipped = false;
        if let Some(max_norm) = self.clip_global_norm {
            if grad_norm > max_norm {
                let scale = max_norm / (grad_norm + EPS);
                for (_, grad) in processed.iter_mut() {
                    *grad = grad.affine(scale, 0.0)?;
                }
                clipped = true;
            }
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let updated_parameters = processed.len();

        for (index, grad) in processed {
            let slot = &mut self.params[index];

            let m = (slot.first_moment.as_tensor().affine(cfg.beta1, 0.0)?
                + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let v = (slot.second_moment.as_tensor().affine(cfg.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = m.affine(1.0 / bias_correction1.max(EPS), 0.0)?;
            let denom = v
                .affine(1.0 / bias_correction2.max(EPS), 0.0)?
                .sqrt()?
                .affine(1.0, cfg.epsilon)?;
            let update = (m_hat / denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = match &slot.master {
                Some(master) => master.as_tensor().clone(),
                None => slot.param.as_tensor().to_dtype(DType::F32)?,
            };
            let base = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };

            slot.write_back(&(base - update)?)?;
            slot.first_moment.set(&m)?;
            slot.second_moment.set(&v)?;
        }

        Ok(StepReport {
            grad_norm,
            clipped,
            updated_parameters,
        })
    }

    /// Drops any gradients still held for tracked parameters.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            grads.remove(slot.param.as_tensor());
        }
    }

    /// Scalar state for JSON; tensors come from [`Self::state_tensors`].
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters: self
                .params
                .iter()
                .map(|slot| ParameterState {
                    name: slot.name.clone(),
                    shape: slot.param.dims().to_vec(),
                    apply_weight_decay: slot.apply_weight_decay,
                    has_master: slot.master.is_some(),
                })
                .collect(),
        }
    }

    /// Moments (and master weights) keyed `{name}.m`, `{name}.v`,
    /// `{name}.master`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::with_capacity(self.params.len() * 3);
        for slot in &self.params {
            tensors.insert(format!("{}.m", slot.name), slot.first_moment.as_tensor().clone());
            tensors.insert(format!("{}.v", slot.name), slot.second_moment.as_tensor().clone());
            if let Some(master) = &slot.master {
                tensors.insert(format!("{}.master", slot.name), master.as_tensor().clone());
            }
        }
        tensors
    }

    pub fn load_state(
        &mut self,
        state: OptimizerState,
        mut tensors: HashMap<String, Tensor>,
    ) -> Result<(), TrainingError> {
        let mut by_name: HashMap<String, ParameterState> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let meta = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            if slot.param.dims() != meta.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}': {:?} vs {:?}",
                    slot.name,
                    meta.shape,
                    slot.param.dims()
                )));
            }
            if meta.has_master != slot.master.is_some() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state master-weight layout differs for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.device().clone();
            let mut take = |suffix: &str| -> Result<Tensor, TrainingError> {
                let key = format!("{}.{suffix}", slot.name);
                let tensor = tensors.remove(&key).ok_or_else(|| {
                    TrainingError::runtime(format!("optimizer tensors missing '{key}'"))
                })?;
                if tensor.dims() != slot.param.dims() {
                    return Err(TrainingError::runtime(format!(
                        "optimizer tensor '{key}' has shape {:?}",
                        tensor.dims()
                    )));
                }
                Ok(tensor.to_device(&device)?.to_dtype(DType::F32)?)
            };

            let first_moment = take("m")?;
            let second_moment = take("v")?;
            let master = if meta.has_master {
                Some(take("master")?)
            } else {
                None
            };

            slot.first_moment.set(&first_moment)?;
            slot.second_moment.set(&second_moment)?;
            slot.apply_weight_decay = meta.apply_weight_decay;
            if let Some(master) = master {
                slot.write_back(&master)?;
            }
        }

        if !by_name.is_empty() {
            let mut extra: Vec<String> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub apply_weight_decay: bool,
    pub has_master: bool,
}
