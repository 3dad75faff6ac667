//! Position-wise feed-forward network.
//!
//! `(batch, seq, hidden)` is expanded to `intermediate_size`, activated, and
//! contracted back. Gated variants fuse `up|gate` into one projection and
//! multiply `activation(gate) * up` before the down projection.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    scoped, NamedParameters,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub activation: ActivationKind,
    pub gated: bool,
    /// Dropout on the activated hidden units while training.
    pub dropout_p: f32,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            gated: false,
            dropout_p: 0.0,
        }
    }

    /// `intermediate_size = hidden_size * ratio`, rounded and at least one.
    pub fn with_expansion_ratio(hidden_size: usize, ratio: f32, activation: ActivationKind) -> Self {
        let intermediate = ((hidden_size as f32) * ratio).round().max(1.0) as usize;
        Self::new(hidden_size, intermediate, activation)
    }

    pub fn gated(mut self, gated: bool) -> Self {
        self.gated = gated;
        self
    }

    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = dropout_p;
        self
    }
}

#[derive(Debug)]
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
    activation: Arc<dyn Activation>,
    training: AtomicBool,
}

impl FeedForward {
    pub fn new(config: FeedForwardConfig, device: &Device, dtype: DType) -> Result<Self> {
        if config.hidden_size == 0 || config.intermediate_size == 0 {
            return Err(Error::Msg(format!(
                "feed-forward sizes must be positive, got hidden={} intermediate={}",
                config.hidden_size, config.intermediate_size
            )));
        }
        if !(0.0..1.0).contains(&config.dropout_p) {
            return Err(Error::Msg(format!(
                "feed-forward dropout must lie in [0, 1), got {}",
                config.dropout_p
            )));
        }
        let fused = if config.gated { 2 } else { 1 };
        let up = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size).fused(fused),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let down = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            activation: builtin(config.activation),
            config,
            up,
            down,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn named_parameters(&self, prefix: &str) -> NamedParameters {
        let mut params = self.up.named_parameters(&scoped(prefix, "up"));
        params.extend(self.down.named_parameters(&scoped(prefix, "down")));
        params
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("feed_forward.input", hidden, self.config.hidden_size)?;

        let projected = self.up.forward(hidden, policy)?;
        let mut activated = if self.config.gated {
            let width = self.config.intermediate_size;
            let up = projected.narrow(D::Minus1, 0, width)?;
            let gate = projected.narrow(D::Minus1, width, width)?;
            let gate = self.activation.forward(&gate, policy)?;
            policy.cast_to_storage(
                &policy
                    .cast_for_matmul(&gate)?
                    .mul(&policy.cast_for_matmul(&up)?)?,
            )?
        } else {
            self.activation.forward(&projected, policy)?
        };

        if self.training.load(Ordering::Relaxed) && self.config.dropout_p > 0.0 {
            activated = candle_nn::ops::dropout(&activated, self.config.dropout_p)?;
        }
        self.down.forward(&activated, policy)
    }
}
