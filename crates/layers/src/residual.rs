//! Residual wiring for pre-norm blocks: `residual + scale * dropout(branch)`.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    /// Dropout applied to the branch output while training.
    pub dropout_p: Option<f32>,
    /// Multiplier on the branch before the add; `None` adds it unscaled.
    pub residual_scale: Option<f32>,
}

impl ResidualConfig {
    pub fn new() -> Self {
        Self {
            dropout_p: None,
            residual_scale: None,
        }
    }

    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = (dropout_p > 0.0).then_some(dropout_p);
        self
    }

    pub fn with_scale(mut self, scale: Option<f32>) -> Self {
        self.residual_scale = scale;
        self
    }
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Residual {
    config: ResidualConfig,
    training: AtomicBool,
}

impl Clone for Residual {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            training: AtomicBool::new(self.is_training()),
        }
    }
}

impl Residual {
    pub fn new(config: ResidualConfig) -> Result<Self> {
        if let Some(p) = config.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!(
                    "residual dropout must lie in [0, 1), got {p}"
                )));
            }
        }
        if let Some(scale) = config.residual_scale {
            if !scale.is_finite() {
                return Err(Error::Msg(format!("residual scale must be finite, got {scale}")));
            }
        }
        Ok(Self {
            config,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Inverted dropout; identity in evaluation mode.
    pub fn apply_dropout(&self, branch: &Tensor) -> Result<Tensor> {
        match self.config.dropout_p {
            Some(p) if self.is_training() => candle_nn::ops::dropout(branch, p),
            _ => Ok(branch.clone()),
        }
    }

    /// Adds `branch` onto `residual`, applying the optional scale.
    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let hidden = residual.dims().last().copied().unwrap_or(0);
        checks::expect_batch_seq_hidden("residual.input", residual, hidden)?;
        checks::expect_shape("residual.branch", branch, residual.dims())?;

        let mut branch = policy.cast_for_matmul(branch)?;
        if let Some(scale) = self.config.residual_scale {
            branch = branch.affine(f64::from(scale), 0.0)?;
        }
        let added = branch.add(&policy.cast_for_matmul(residual)?)?;
        policy.cast_to_storage(&added)
    }

    /// Dropout on the branch output followed by the residual add.
    pub fn prenorm_step(
        &self,
        branch_output: &Tensor,
        residual_input: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let dropped = self.apply_dropout(branch_output)?;
        self.add(&dropped, residual_input, policy)
    }
}
