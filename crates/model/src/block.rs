//! Pre-norm causal decoder block.
//!
//! `x + Dropout(OutProj(CausalMHA(Norm(x))))` followed by
//! `x + Dropout(FF(Norm(x)))`. Heads are `dim_head` wide and the concatenated
//! width `heads * dim_head` may differ from the model width.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use attention::{Attention, Config as AttentionConfig, ExactAttention};
use candle_core::{bail, Error, Result, Tensor, D};
use embedding::Rope;
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    mlp::{FeedForward, FeedForwardConfig},
    norm::{build_norm, NormalizationLayer},
    residual::{Residual, ResidualConfig},
    scoped, NamedParameters,
};

use crate::config::AlrConfig;

#[derive(Debug)]
pub struct DecoderBlock {
    dim: usize,
    heads: usize,
    dim_head: usize,
    attn_dropout: f32,
    policy: PrecisionPolicy,
    norm_attn: Box<dyn NormalizationLayer>,
    qkv_proj: Linear,
    out_proj: Linear,
    norm_ff: Box<dyn NormalizationLayer>,
    ff: FeedForward,
    attention: ExactAttention,
    rope: Option<Arc<Rope>>,
    residual_attn: Residual,
    residual_ff: Residual,
    training: AtomicBool,
}

impl DecoderBlock {
    /// `rope` is shared between all blocks of a model.
    pub fn new(config: &AlrConfig, rope: Option<Arc<Rope>>) -> Result<Self> {
        let (device, dtype) = (&config.device, config.dtype);
        let inner = config.inner_dim();

        let qkv_proj = Linear::with_init(
            LinearConfig::new(config.dim, inner).fused(3),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let out_init = LinearInit::scaled(
            LinearInit::XavierUniform,
            1.0 / (2.0 * config.depth as f64).sqrt(),
        );
        let out_proj = Linear::with_init(LinearConfig::new(inner, config.dim), &out_init, device, dtype)?;

        let ff_config =
            FeedForwardConfig::with_expansion_ratio(config.dim, config.ff_mult, config.activation)
                .gated(config.gated_ff)
                .with_dropout(config.ff_dropout);
        let residual = ResidualConfig::new()
            .with_dropout(config.residual_dropout)
            .with_scale(config.residual_scale);

        Ok(Self {
            dim: config.dim,
            heads: config.heads,
            dim_head: config.dim_head,
            attn_dropout: config.attn_dropout,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            norm_attn: build_norm(config.norm_kind, config.dim, config.norm_eps, device, dtype)?,
            qkv_proj,
            out_proj,
            norm_ff: build_norm(config.norm_kind, config.dim, config.norm_eps, device, dtype)?,
            ff: FeedForward::new(ff_config, device, dtype)?,
            attention: ExactAttention::new(),
            rope,
            residual_attn: Residual::new(residual.clone())?,
            residual_ff: Residual::new(residual)?,
            training: AtomicBool::new(true),
        })
    }

    /// `[B, T, heads * dim_head]` -> `[B, heads, T, dim_head]`.
    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, self.heads, self.dim_head))?
            .transpose(1, 2)
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, dim_head) = tensor.dims4()?;
        if (heads, dim_head) != (self.heads, self.dim_head) {
            bail!("attention output expected {} heads of width {}", self.heads, self.dim_head);
        }
        tensor
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, heads * dim_head))
    }

    /// Causal self-attention sublayer without the residual add.
    fn attend(&self, normed: &Tensor, mask: &Tensor, offset: usize) -> Result<Tensor> {
        let inner = self.heads * self.dim_head;
        let qkv = self.qkv_proj.forward(normed, &self.policy)?;
        let q = self.split_heads(&qkv.narrow(D::Minus1, 0, inner)?)?;
        let k = self.split_heads(&qkv.narrow(D::Minus1, inner, inner)?)?;
        let v = self.split_heads(&qkv.narrow(D::Minus1, 2 * inner, inner)?)?;

        let (q, k) = match &self.rope {
            Some(rope) => rope.apply(&q, &k, offset)?,
            None => (q, k),
        };

        let attn_config = if self.training.load(Ordering::Relaxed) {
            AttentionConfig::with_dropout(self.attn_dropout)
        } else {
            AttentionConfig::default()
        };
        let attended = self
            .attention
            .attend(&q, &k, &v, Some(mask), &attn_config)
            .map_err(Error::wrap)?;
        self.out_proj.forward(&self.merge_heads(&attended)?, &self.policy)
    }

    /// `mask` is an additive causal mask broadcastable to `[B, heads, T, T]`;
    /// `offset` is the absolute position of the first token.
    pub fn forward(&self, hidden: &Tensor, mask: &Tensor, offset: usize) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("decoder.input", hidden, self.dim)?;

        let normed = self.norm_attn.forward(hidden, &self.policy)?;
        let attn_out = self.attend(&normed, mask, offset)?;
        let hidden = self.residual_attn.prenorm_step(&attn_out, hidden, &self.policy)?;

        let normed = self.norm_ff.forward(&hidden, &self.policy)?;
        let ff_out = self.ff.forward(&normed, &self.policy)?;
        self.residual_ff.prenorm_step(&ff_out, &hidden, &self.policy)
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        self.ff.set_training(training);
        self.residual_attn.set_training(training);
        self.residual_ff.set_training(training);
    }

    pub fn named_parameters(&self, prefix: &str) -> NamedParameters {
        let mut params = self.norm_attn.named_parameters(&scoped(prefix, "attn_norm"));
        params.extend(self.qkv_proj.named_parameters(&scoped(prefix, "qkv_proj")));
        params.extend(self.out_proj.named_parameters(&scoped(prefix, "out_proj")));
        params.extend(self.norm_ff.named_parameters(&scoped(prefix, "ff_norm")));
        params.extend(self.ff.named_parameters(&scoped(prefix, "ff")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attention::masks::build_causal_mask;
    use candle_core::{Device, IndexOp};
    use embedding::RopeConfig;

    #[test]
    fn inner_width_can_differ_from_model_width() -> Result<()> {
        let config = AlrConfig::new(6, 1, 10).heads(3).dim_head(4);
        let block = DecoderBlock::new(&config, None)?;
        let params = block.named_parameters("d");
        let qkv = params
            .iter()
            .find(|(name, _)| name == "d.qkv_proj.weight")
            .map(|(_, v)| v.dims().to_vec());
        assert_eq!(qkv, Some(vec![36, 6]));

        let input = Tensor::randn(0f32, 1.0, (2, 5, 6), &Device::Cpu)?;
        let mask = build_causal_mask(&Device::Cpu, 1, 1, 5, 5)?;
        assert_eq!(block.forward(&input, &mask, 0)?.dims(), &[2, 5, 6]);
        Ok(())
    }

    #[test]
    fn earlier_positions_ignore_later_tokens() -> Result<()> {
        let device = Device::Cpu;
        let config = AlrConfig::new(8, 1, 10).heads(2).dim_head(4);
        let rope = Arc::new(Rope::new(RopeConfig::new(4), 8, &device)?);
        let block = DecoderBlock::new(&config, Some(rope))?;
        block.set_training(false);

        let input = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        let tail = Tensor::randn(0f32, 1.0, (1, 1, 8), &device)?;
        let altered = Tensor::cat(&[input.i((.., 0..3, ..))?, tail], 1)?;
        let mask = build_causal_mask(&device, 1, 1, 4, 4)?;

        let a = block.forward(&input, &mask, 0)?.i((.., 0..3, ..))?;
        let b = block.forward(&altered, &mask, 0)?.i((.., 0..3, ..))?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
