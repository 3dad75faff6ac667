//! Attention layer replacement: a shallow feed-forward network standing in
//! for the attention sublayer.
//!
//! `x + Dropout(FF(Norm(x)))` with `FF = Linear(dim, dim * alr_mult) ->
//! activation -> Dropout -> Linear(dim * alr_mult, dim)`. The network is
//! applied independently at every position.

use candle_core::{Result, Tensor};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    mlp::{FeedForward, FeedForwardConfig},
    norm::{build_norm, NormalizationLayer},
    residual::{Residual, ResidualConfig},
    scoped, NamedParameters,
};

use crate::config::AlrConfig;

#[derive(Debug)]
pub struct AlrBlock {
    dim: usize,
    policy: PrecisionPolicy,
    norm: Box<dyn NormalizationLayer>,
    ff: FeedForward,
    residual: Residual,
}

impl AlrBlock {
    pub fn new(config: &AlrConfig) -> Result<Self> {
        let norm = build_norm(
            config.norm_kind,
            config.dim,
            config.norm_eps,
            &config.device,
            config.dtype,
        )?;
        let ff_config = FeedForwardConfig::with_expansion_ratio(
            config.dim,
            config.effective_alr_mult(),
            config.activation,
        )
        .with_dropout(config.ff_dropout);
        let ff = FeedForward::new(ff_config, &config.device, config.dtype)?;
        let residual = Residual::new(
            ResidualConfig::new()
                .with_dropout(config.residual_dropout)
                .with_scale(config.residual_scale),
        )?;

        Ok(Self {
            dim: config.dim,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
            norm,
            ff,
            residual,
        })
    }

    pub fn hidden_width(&self) -> usize {
        self.ff.config().intermediate_size
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("alr.input", hidden, self.dim)?;
        let normed = self.norm.forward(hidden, &self.policy)?;
        let branch = self.ff.forward(&normed, &self.policy)?;
        self.residual.prenorm_step(&branch, hidden, &self.policy)
    }

    pub fn set_training(&self, training: bool) {
        self.ff.set_training(training);
        self.residual.set_training(training);
    }

    pub fn named_parameters(&self, prefix: &str) -> NamedParameters {
        let mut params = self.norm.named_parameters(&scoped(prefix, "norm"));
        params.extend(self.ff.named_parameters(&scoped(prefix, "ff")));
        params
    }
}
