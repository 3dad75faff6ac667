//! Token embedding table with an optional tied readout head.

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};
use layers::{scoped, NamedParameters, PrecisionPolicy};

#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    /// Standard deviation of the normal initialisation.
    pub init_std: f64,
    pub dtype: DType,
    pub device: Device,
}

impl TokenEmbeddingConfig {
    pub fn new(vocab_size: usize, hidden_dim: usize, dtype: DType, device: Device) -> Self {
        Self {
            vocab_size,
            hidden_dim,
            init_std: 0.02,
            dtype,
            device,
        }
    }
}

/// Learnable `(vocab_size, hidden_dim)` table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
    policy: PrecisionPolicy,
}

impl TokenEmbedding {
    pub fn new(config: TokenEmbeddingConfig) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        let shape = (config.vocab_size, config.hidden_dim);
        let initial = Tensor::randn(0f32, config.init_std as f32, shape, &config.device)?
            .to_dtype(config.dtype)?;
        layers::checks::expect_parameter_dtype("embedding.weight", &initial)?;
        Ok(Self {
            weight: Var::from_tensor(&initial)?,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
            config,
        })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn named_parameters(&self, prefix: &str) -> NamedParameters {
        vec![(scoped(prefix, "weight"), self.weight.clone())]
    }

    /// Gathers rows for `(batch, seq)` integer ids, producing `(batch, seq, hidden)`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = match token_ids.dims() {
            [batch, seq] if *batch > 0 && *seq > 0 => (*batch, *seq),
            [_, _] => bail!("token_ids must have non-zero batch and seq dimensions"),
            dims => bail!("token_ids must be shaped [batch, seq], got {dims:?}"),
        };
        if !token_ids.dtype().is_int() {
            bail!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            );
        }

        let flat = token_ids.flatten_all()?;
        self.ensure_id_range(&flat)?;
        let index = flat.to_dtype(DType::U32)?;
        self.weight
            .as_tensor()
            .index_select(&index, 0)?
            .reshape((batch, seq, self.config.hidden_dim))
    }

    /// Projects hidden states onto the vocabulary with the transposed table.
    pub fn linear_out(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq) = match hidden.dims() {
            [batch, seq, width] if *width == self.config.hidden_dim => (*batch, *seq),
            dims => {
                return Err(Error::Msg(format!(
                    "linear_out expects [batch, seq, {}], got {dims:?}",
                    self.config.hidden_dim
                )))
            }
        };
        let input = self
            .policy
            .cast_for_matmul(hidden)?
            .reshape((batch * seq, self.config.hidden_dim))?;
        let weight_t = self.policy.cast_for_matmul(self.weight.as_tensor())?.t()?;
        let logits = input
            .matmul(&weight_t)?
            .reshape((batch, seq, self.config.vocab_size))?;
        self.policy.cast_to_storage(&logits)
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let ids = flat_ids.to_dtype(DType::I64)?;
        let min_id = ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            bail!("encountered negative token id {min_id}");
        }
        let max_id = ids.max_all()?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            bail!("token id {max_id} exceeds vocab size {vocab}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_match_gathered_weights() -> Result<()> {
        let device = Device::Cpu;
        let embedding = TokenEmbedding::new(TokenEmbeddingConfig::new(5, 3, DType::F32, device.clone()))?;
        let ids = Tensor::new(&[[4u32, 1]], &device)?;
        let out = embedding.forward(&ids)?;
        let row = out.get(0)?.get(0)?.to_vec1::<f32>()?;
        let expected = embedding.weight().get(4)?.to_vec1::<f32>()?;
        assert_eq!(row, expected);
        Ok(())
    }
}
