use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use attention::masks::build_causal_mask;
use candle_core::{bail, Result, Tensor};
use embedding::{Rope, RopeConfig, TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{build_norm, NormalizationLayer},
    NamedParameters,
};

use crate::{
    alr::AlrBlock,
    block::DecoderBlock,
    config::{AlrConfig, PositionalEncoding},
};

/// Rotary tables are precomputed up to this many positions and grown on demand.
const INITIAL_ROPE_POSITIONS: usize = 2048;

#[derive(Debug)]
struct AlrLayer {
    alr: AlrBlock,
    decoder: DecoderBlock,
}

/// Decoder-only language model built from `depth` ALR + decoder layers.
#[derive(Debug)]
pub struct AlrTransformer {
    config: AlrConfig,
    embedding: TokenEmbedding,
    layers: Vec<AlrLayer>,
    final_norm: Box<dyn NormalizationLayer>,
    /// `None` when the readout is tied to the embedding table.
    lm_head: Option<Linear>,
    policy: PrecisionPolicy,
    training: AtomicBool,
}

impl AlrTransformer {
    pub fn new(config: AlrConfig) -> Result<Self> {
        config.validate()?;
        let (device, dtype) = (&config.device, config.dtype);

        let embedding = TokenEmbedding::new(TokenEmbeddingConfig::new(
            config.num_tokens,
            config.dim,
            dtype,
            device.clone(),
        ))?;

        let rope = match config.positional {
            PositionalEncoding::Rotary => {
                let rope_config = RopeConfig {
                    head_dim: config.dim_head,
                    theta: config.rope_theta,
                };
                let initial = config
                    .max_seq_len
                    .unwrap_or(INITIAL_ROPE_POSITIONS)
                    .min(INITIAL_ROPE_POSITIONS);
                Some(Arc::new(Rope::new(rope_config, initial, device)?))
            }
            PositionalEncoding::None => None,
        };

        let layers = (0..config.depth)
            .map(|_| {
                Ok(AlrLayer {
                    alr: AlrBlock::new(&config)?,
                    decoder: DecoderBlock::new(&config, rope.clone())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let final_norm = build_norm(config.norm_kind, config.dim, config.norm_eps, device, dtype)?;
        let lm_head = if config.tie_embeddings {
            None
        } else {
            Some(Linear::with_init(
                LinearConfig::new(config.dim, config.num_tokens).without_bias(),
                &LinearInit::Normal { std: 0.02 },
                device,
                dtype,
            )?)
        };

        let model = Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            config,
            embedding,
            layers,
            final_norm,
            lm_head,
            training: AtomicBool::new(true),
        };
        log::info!(
            "built ALR transformer: dim={} depth={} heads={}x{} vocab={} params={}",
            model.config.dim,
            model.config.depth,
            model.config.heads,
            model.config.dim_head,
            model.config.num_tokens,
            model.num_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &AlrConfig {
        &self.config
    }

    /// Maps `(batch, seq)` token ids to logits `(batch, seq, num_tokens)`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (_, seq) = token_ids.dims2()?;
        if let Some(max) = self.config.max_seq_len {
            if seq > max {
                bail!("sequence length {seq} exceeds max_seq_len {max}");
            }
        }

        let mut hidden = self.embedding.forward(token_ids)?;
        let mask = build_causal_mask(&self.config.device, 1, 1, seq, seq)?;
        for layer in &self.layers {
            hidden = layer.alr.forward(&hidden)?;
            hidden = layer.decoder.forward(&hidden, &mask, 0)?;
        }

        let normed = self.final_norm.forward(&hidden, &self.policy)?;
        match &self.lm_head {
            Some(head) => head.forward(&normed, &self.policy),
            None => self.embedding.linear_out(&normed),
        }
    }

    /// Every trainable tensor, keyed by its checkpoint name.
    pub fn parameters(&self) -> NamedParameters {
        let mut params = self.embedding.named_parameters("token_embedding");
        for (index, layer) in self.layers.iter().enumerate() {
            params.extend(layer.alr.named_parameters(&format!("layers.{index}.alr")));
            params.extend(layer.decoder.named_parameters(&format!("layers.{index}.decoder")));
        }
        params.extend(self.final_norm.named_parameters("final_norm"));
        if let Some(head) = &self.lm_head {
            params.extend(head.named_parameters("lm_head"));
        }
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }

    /// Toggles dropout in every layer.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        for layer in &self.layers {
            layer.alr.set_training(training);
            layer.decoder.set_training(training);
        }
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }
}
